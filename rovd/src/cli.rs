// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command line interface. Every flag falls back to an `ROV_*` environment
//! variable, and is translated into the plain config structs the library
//! crates accept.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use feed::framer::{DEFAULT_RIB_PORT, DEFAULT_UPDATE_PORT};
use rov::coordinator::DEFAULT_HIGH_WATERMARK;
use rov::persist::{IngestConfig, PeriodicConfig, WithdrawPolicy};
use rov::{CoordinatorConfig, OracleConfig};
use std::path::PathBuf;
use std::time::Duration;
use vdb::{ArchiveMode, ArchivePolicy};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, infer_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Least severe log level written to stderr
    #[arg(
        long,
        env = "ROV_LOG_LEVEL",
        default_value = "info",
        value_parser = rov_common::log::parse_level,
        global = true
    )]
    pub log_level: slog::Level,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole pipeline: feed, validation and storage.
    Run(RunArgs),

    /// Read the route monitor and write route event lines to stdout.
    Parse(FeedArgs),

    /// Validate route event lines from stdin, writing pipeline lines to
    /// stdout.
    Validate(OracleArgs),

    /// Store pipeline lines from stdin and maintain the store.
    Store(StoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub feed: FeedArgs,

    #[command(flatten)]
    pub oracle: OracleArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// How the table snapshot and the live updates are brought in step.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Table start/stop markers on the RIB port gate the update port.
    Markers,
    /// A historical window of updates serves as the baseline.
    Window,
    /// Trust the update stream from the first envelope.
    None,
}

#[derive(Args, Debug, Clone)]
pub struct FeedArgs {
    /// Route monitor host
    #[arg(long, env = "ROV_BGPMON_HOST", default_value = "localhost")]
    pub bgpmon_host: String,

    /// Route monitor update stream port
    #[arg(long, env = "ROV_UPDATE_PORT", default_value_t = DEFAULT_UPDATE_PORT)]
    pub update_port: u16,

    /// Route monitor table snapshot port
    #[arg(long, env = "ROV_RIB_PORT", default_value_t = DEFAULT_RIB_PORT)]
    pub rib_port: u16,

    #[arg(long, env = "ROV_SYNC", value_enum, default_value_t = SyncMode::Markers)]
    pub sync: SyncMode,

    /// Read the update stream from a file instead of the monitor
    #[arg(long, env = "ROV_FEED_FILE")]
    pub feed_file: Option<PathBuf>,

    /// Read the table snapshot stream from a file instead of the monitor
    #[arg(long, env = "ROV_RIB_FILE")]
    pub rib_file: Option<PathBuf>,

    /// Historical update stream used as the baseline with `--sync window`
    #[arg(long, env = "ROV_BASELINE_FILE")]
    pub baseline_file: Option<PathBuf>,

    /// Length of the baseline window
    #[arg(
        long,
        env = "ROV_WINDOW",
        default_value = "4h",
        value_parser = humantime::parse_duration
    )]
    pub window: Duration,

    /// Delay between the window cut and the present
    #[arg(
        long,
        env = "ROV_SETTLE",
        default_value = "10m",
        value_parser = humantime::parse_duration
    )]
    pub settle: Duration,

    /// Window cut point in RFC 3339 form. Defaults to now minus the
    /// settling delay.
    #[arg(long, env = "ROV_CUT", value_parser = parse_cut)]
    pub cut: Option<DateTime<Utc>>,
}

fn parse_cut(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad cut time '{s}': {e}"))
}

impl FeedArgs {
    /// Window cut in seconds since the epoch.
    pub fn cut(&self, now: DateTime<Utc>) -> i64 {
        match self.cut {
            Some(cut) => cut.timestamp(),
            None => {
                let settle =
                    i64::try_from(self.settle.as_secs()).unwrap_or(i64::MAX);
                now.timestamp().saturating_sub(settle)
            }
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct OracleArgs {
    /// Validation oracle executable, run as `<path> <cache-host> <cache-port>`
    #[arg(long, env = "ROV_VALIDATOR_PATH")]
    pub validator_path: PathBuf,

    /// RPKI cache server host handed to the oracle
    #[arg(long, env = "ROV_CACHE_HOST", default_value = "localhost")]
    pub cache_host: String,

    /// RPKI cache server port handed to the oracle
    #[arg(long, env = "ROV_CACHE_PORT", default_value_t = 8282)]
    pub cache_port: u16,

    /// How long to wait for one oracle answer
    #[arg(
        long,
        env = "ROV_ORACLE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub oracle_timeout: Duration,

    /// Attempts per request before reporting a connection error
    #[arg(long, env = "ROV_ORACLE_ATTEMPTS", default_value_t = 3)]
    pub oracle_attempts: u32,

    /// Validation workers, each with its own oracle process
    #[arg(
        long,
        env = "ROV_WORKERS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: u16,
}

impl OracleArgs {
    pub fn config(&self) -> OracleConfig {
        let mut config = OracleConfig::new(
            self.validator_path.clone(),
            &self.cache_host,
            self.cache_port,
        );
        config.response_timeout = self.oracle_timeout;
        config.max_attempts = self.oracle_attempts;
        config
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sled,
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawPolicyArg {
    Retain,
    Delete,
}

impl From<WithdrawPolicyArg> for WithdrawPolicy {
    fn from(value: WithdrawPolicyArg) -> Self {
        match value {
            WithdrawPolicyArg::Retain => WithdrawPolicy::Retain,
            WithdrawPolicyArg::Delete => WithdrawPolicy::Delete,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveModeArg {
    Archive,
    Delete,
}

impl From<ArchiveModeArg> for ArchiveMode {
    fn from(value: ArchiveModeArg) -> Self {
        match value {
            ArchiveModeArg::Archive => ArchiveMode::Archive,
            ArchiveModeArg::Delete => ArchiveMode::Delete,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Store backend
    #[arg(long = "store", env = "ROV_STORE", value_enum, default_value_t = StoreKind::Sled)]
    pub backend: StoreKind,

    /// Database directory of the sled backend
    #[arg(long, env = "ROV_DB_PATH", default_value = "/var/lib/rov/vdb")]
    pub db_path: String,

    /// Keep the history of withdrawn prefixes, or delete it
    #[arg(
        long,
        env = "ROV_WITHDRAW_POLICY",
        value_enum,
        default_value_t = WithdrawPolicyArg::Retain
    )]
    pub withdraw_policy: WithdrawPolicyArg,

    /// Archive superseded records, or delete them
    #[arg(
        long,
        env = "ROV_ARCHIVE_MODE",
        value_enum,
        default_value_t = ArchiveModeArg::Archive
    )]
    pub archive_mode: ArchiveModeArg,

    /// Purge NotFound records older than this
    #[arg(
        long,
        env = "ROV_NOTFOUND_MAX_AGE",
        value_parser = humantime::parse_duration
    )]
    pub notfound_max_age: Option<Duration>,

    /// Prune statistics snapshots older than this
    #[arg(
        long,
        env = "ROV_STATS_MAX_AGE",
        value_parser = humantime::parse_duration
    )]
    pub stats_max_age: Option<Duration>,

    /// Records written per batch
    #[arg(long, env = "ROV_BATCH_MAX", default_value_t = 10_000)]
    pub batch_max: usize,

    /// Longest time a record waits before its batch is written
    #[arg(
        long,
        env = "ROV_BATCH_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub batch_timeout: Duration,

    /// Interval of compaction, statistics and archival
    #[arg(
        long,
        env = "ROV_MAINTENANCE_INTERVAL",
        default_value = "10m",
        value_parser = humantime::parse_duration
    )]
    pub maintenance_interval: Duration,

    /// Compact early once this many records were written since the last run
    #[arg(long, env = "ROV_COMPACT_AFTER", default_value_t = 10_000)]
    pub compact_after: usize,

    /// Queue depth at which validators are paused
    #[arg(
        long,
        env = "ROV_HIGH_WATERMARK",
        default_value_t = DEFAULT_HIGH_WATERMARK
    )]
    pub high_watermark: usize,
}

impl StoreArgs {
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            batch_max: self.batch_max.max(1),
            batch_timeout: self.batch_timeout,
            withdraw_policy: self.withdraw_policy.into(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new(self.high_watermark)
    }

    pub fn archive_policy(&self) -> ArchivePolicy {
        ArchivePolicy {
            mode: self.archive_mode.into(),
            notfound_max_age: self.notfound_max_age,
            stats_max_age: self.stats_max_age,
        }
    }

    pub fn periodic_config(&self) -> PeriodicConfig {
        PeriodicConfig::new(self.maintenance_interval)
    }

    pub fn compaction_config(&self) -> PeriodicConfig {
        PeriodicConfig {
            early_after_records: Some(self.compact_after.max(1)),
            ..self.periodic_config()
        }
    }
}
