// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence workers: batched ingest from the coordinator and the
//! periodic compaction, statistics and archive duties.
//!
//! No failure here is fatal. A failed store operation is logged and the
//! work it covered is skipped; the next cycle starts over against a
//! reconnected store if the backend reports itself closed.

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::log::rov_log;
use crate::pipeline::{PipelineItem, PipelineMessage};
use rov_common::Shutdown;
use slog::Logger;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vdb::{
    ArchivePolicy, ArchiveReport, CompactionReport, StatsSnapshot,
    ValidityRecord, ValidityStore,
};

const MODULE: &str = crate::MOD_PERSIST;
const UNIT: &str = "ingest";

/// What to do with the history of a prefix when it is withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WithdrawPolicy {
    /// Record a terminal withdrawn record and keep the history.
    #[default]
    Retain,
    /// Delete every raw record of the prefix.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    pub batch_max: usize,
    pub batch_timeout: Duration,
    pub withdraw_policy: WithdrawPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_max: 10_000,
            batch_timeout: Duration::from_secs(30),
            withdraw_policy: WithdrawPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub written: u64,
    pub batches: u64,
    pub removed: u64,
    pub failed_batches: u64,
}

/// Reconnect a store that reports itself closed. Errors are logged only;
/// the following operation reports its own failure.
fn ensure_connected(store: &dyn ValidityStore, log: &Logger, unit: &str) {
    if !store.is_closed() {
        return;
    }
    match store.reconnect() {
        Ok(()) => {
            slog::info!(log, "store reconnected";
                "component" => crate::COMPONENT_ROV,
                "module" => MODULE,
                "unit" => unit.to_string(),
                "backend" => store.backend()
            );
        }
        Err(e) => {
            slog::error!(log, "store reconnect failed: {e}";
                "component" => crate::COMPONENT_ROV,
                "module" => MODULE,
                "unit" => unit.to_string(),
                "backend" => store.backend()
            );
        }
    }
}

/// Drains the coordinator into the store in batches.
pub struct IngestWorker {
    store: Arc<dyn ValidityStore>,
    coordinator: Coordinator,
    config: IngestConfig,
    pending: Vec<ValidityRecord>,
    stats: IngestStats,
    log: Logger,
}

impl IngestWorker {
    pub fn new(
        store: Arc<dyn ValidityStore>,
        coordinator: Coordinator,
        config: IngestConfig,
        log: Logger,
    ) -> Self {
        Self {
            store,
            coordinator,
            pending: Vec::with_capacity(config.batch_max.min(1 << 16)),
            config,
            stats: IngestStats::default(),
            log,
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        ensure_connected(self.store.as_ref(), &self.log, UNIT);
        match self.store.ingest(&self.pending) {
            Ok(n) => {
                self.stats.written += n as u64;
                self.stats.batches += 1;
                rov_log!(self, debug, "batch written"; "records" => n);
            }
            Err(e) => {
                self.stats.failed_batches += 1;
                rov_log!(self, error, "batch write failed: {e}";
                    "records" => self.pending.len()
                );
            }
        }
        self.pending.clear();
    }

    fn accept(&mut self, msg: PipelineMessage) {
        match (self.config.withdraw_policy, msg) {
            (WithdrawPolicy::Delete, PipelineMessage::Withdraw(w)) => {
                // Earlier records of the prefix may still be pending.
                self.flush();
                ensure_connected(self.store.as_ref(), &self.log, UNIT);
                match self.store.remove_prefix(&w.prefix) {
                    Ok(n) => self.stats.removed += n as u64,
                    Err(e) => {
                        rov_log!(self, error, "prefix removal failed: {e}";
                            "prefix" => w.prefix.to_string()
                        );
                    }
                }
            }
            (_, msg) => self.pending.push(msg.into_record()),
        }
    }

    /// Consume the coordinator until `Stop` or until it is closed. Pending
    /// records are flushed either way, and the coordinator is closed so no
    /// producer stays blocked on a queue nobody drains.
    pub fn run(mut self) -> IngestStats {
        rov_log!(self, info, "ingest started";
            "backend" => self.store.backend(),
            "batch_max" => self.config.batch_max
        );
        let mut last_flush = Instant::now();
        loop {
            let wait = self
                .config
                .batch_timeout
                .saturating_sub(last_flush.elapsed());
            match self.coordinator.recv_timeout(wait) {
                Ok(PipelineItem::Message(msg)) => {
                    self.stats.received += 1;
                    self.accept(msg);
                    // A steady stream never times out the receive, so the
                    // batch age is checked here as well.
                    if self.pending.len() >= self.config.batch_max
                        || last_flush.elapsed() >= self.config.batch_timeout
                    {
                        self.flush();
                        last_flush = Instant::now();
                    }
                }
                Ok(PipelineItem::Stop) => {
                    rov_log!(self, info, "stop received");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.flush();
                    last_flush = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.flush();
        self.coordinator.close();
        rov_log!(self, info, "ingest finished";
            "received" => self.stats.received,
            "written" => self.stats.written,
            "batches" => self.stats.batches,
            "removed" => self.stats.removed,
            "failed_batches" => self.stats.failed_batches
        );
        self.stats
    }
}

/// A periodic store maintenance duty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    Compact,
    Stats,
    Archive(ArchivePolicy),
}

impl Duty {
    pub fn name(&self) -> &'static str {
        match self {
            Duty::Compact => "compaction",
            Duty::Stats => "stats",
            Duty::Archive(_) => "archive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyReport {
    Compacted(CompactionReport),
    Stats(Option<StatsSnapshot>),
    Archived(ArchiveReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicConfig {
    pub interval: Duration,

    /// How often the worker wakes to check for shutdown and early triggers.
    pub poll: Duration,

    /// Run ahead of schedule once the raw record count has moved by at
    /// least this much since the previous run.
    pub early_after_records: Option<usize>,
}

impl PeriodicConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            poll: Duration::from_secs(1),
            early_after_records: None,
        }
    }
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

pub struct PeriodicWorker {
    store: Arc<dyn ValidityStore>,
    duty: Duty,
    config: PeriodicConfig,
    last_run: Option<Instant>,
    last_count: Option<usize>,
    log: Logger,
}

impl PeriodicWorker {
    pub fn new(
        store: Arc<dyn ValidityStore>,
        duty: Duty,
        config: PeriodicConfig,
        log: Logger,
    ) -> Self {
        Self {
            store,
            duty,
            config,
            last_run: None,
            last_count: None,
            log,
        }
    }

    pub fn duty(&self) -> Duty {
        self.duty
    }

    /// Perform the duty once.
    pub fn run_once(&self) -> Result<DutyReport, Error> {
        let report = match self.duty {
            Duty::Compact => DutyReport::Compacted(self.store.compact()?),
            Duty::Stats => DutyReport::Stats(self.store.snapshot_stats()?),
            Duty::Archive(policy) => {
                DutyReport::Archived(self.store.archive_or_purge(&policy)?)
            }
        };
        Ok(report)
    }

    fn due(&self) -> bool {
        let Some(last) = self.last_run else {
            return true;
        };
        if last.elapsed() >= self.config.interval {
            return true;
        }
        match (self.config.early_after_records, self.last_count) {
            (Some(threshold), Some(before)) => self
                .store
                .record_count()
                .map(|now| now.abs_diff(before) >= threshold)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn cycle(&mut self) {
        let unit = self.duty.name();
        ensure_connected(self.store.as_ref(), &self.log, unit);
        // Counted first so records arriving mid-run count towards the next
        // early trigger.
        let count = self.store.record_count().ok();
        let started = Instant::now();
        match self.run_once() {
            Ok(report) => {
                slog::info!(self.log, "duty complete";
                    "component" => crate::COMPONENT_ROV,
                    "module" => MODULE,
                    "unit" => unit,
                    "report" => format!("{report:?}"),
                    "elapsed_ms" => started.elapsed().as_millis() as u64
                );
            }
            Err(e) => {
                slog::error!(self.log, "duty failed: {e}";
                    "component" => crate::COMPONENT_ROV,
                    "module" => MODULE,
                    "unit" => unit
                );
            }
        }
        self.last_run = Some(Instant::now());
        self.last_count = count;
    }

    /// Run the duty on its schedule until `shutdown` triggers. Compaction
    /// runs one last time on the way out so the latest view reflects every
    /// ingested record.
    pub fn run(mut self, shutdown: &Shutdown) {
        while !shutdown.is_triggered() {
            if self.due() {
                self.cycle();
            }
            if shutdown.sleep(self.config.poll) {
                break;
            }
        }
        if self.duty == Duty::Compact {
            self.cycle();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use pretty_assertions::assert_eq;
    use rov_common::log::discard_logger;
    use rov_common::{cidr, wait_for_eq, ManagedThread};
    use vdb::{
        Asn, EventType, MemStore, Prefix, ValidityState, Verdict, VrpBuckets,
    };

    fn prefix(s: &str) -> Prefix {
        cidr!(s)
    }

    fn announce(p: &str, ts: i64, state: ValidityState) -> PipelineItem {
        PipelineItem::Message(PipelineMessage::announcement(
            prefix(p),
            Asn(65001),
            ts,
            Verdict {
                state,
                vrps: Some(VrpBuckets::default()),
            },
            None,
            None,
        ))
    }

    fn withdraw(p: &str, ts: i64) -> PipelineItem {
        PipelineItem::Message(PipelineMessage::withdraw(prefix(p), ts, None))
    }

    fn setup() -> (Arc<MemStore>, Coordinator) {
        (
            Arc::new(MemStore::new(discard_logger())),
            Coordinator::new(CoordinatorConfig::new(64), discard_logger()),
        )
    }

    fn ingest(
        store: &Arc<MemStore>,
        coordinator: &Coordinator,
        config: IngestConfig,
    ) -> IngestWorker {
        IngestWorker::new(
            store.clone(),
            coordinator.clone(),
            config,
            discard_logger(),
        )
    }

    #[test]
    fn ingest_until_stop() {
        let (store, c) = setup();
        assert!(c.send(announce("10.0.0.0/24", 1, ValidityState::NotFound)));
        assert!(c.send(announce("10.0.0.0/24", 2, ValidityState::Valid)));
        assert!(c.send(withdraw("10.1.0.0/16", 3)));
        assert!(c.send(PipelineItem::Stop));

        let stats = ingest(&store, &c, IngestConfig::default()).run();
        assert_eq!(
            stats,
            IngestStats {
                received: 3,
                written: 3,
                batches: 1,
                removed: 0,
                failed_batches: 0,
            }
        );
        assert_eq!(store.record_count().expect("count"), 3);
        assert!(c.is_closed());

        let history = store.history(&prefix("10.1.0.0/16")).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::Withdrawn);
    }

    #[test]
    fn batch_size_and_timeout_flush() {
        let (store, c) = setup();
        let config = IngestConfig {
            batch_max: 2,
            batch_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let worker = ingest(&store, &c, config);
        let handle = std::thread::spawn(move || worker.run());

        for ts in 0..3 {
            assert!(c.send(announce("10.0.0.0/24", ts, ValidityState::Valid)));
        }
        wait_for_eq!(store.record_count().expect("count"), 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.record_count().expect("count"), 2);

        assert!(c.send(PipelineItem::Stop));
        let stats = handle.join().expect("ingest");
        assert_eq!(stats.written, 3);
        assert_eq!(store.record_count().expect("count"), 3);

        let (store, c) = setup();
        let config = IngestConfig {
            batch_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let worker = ingest(&store, &c, config);
        let handle = std::thread::spawn(move || worker.run());
        assert!(c.send(announce("10.0.0.0/24", 1, ValidityState::Valid)));
        wait_for_eq!(store.record_count().expect("count"), 1);
        assert!(c.send(PipelineItem::Stop));
        handle.join().expect("ingest");
    }

    #[test]
    fn batch_timeout_flushes_busy_queue() {
        let (store, c) = setup();
        for ts in 0..3 {
            assert!(c.send(announce("10.0.0.0/24", ts, ValidityState::Valid)));
        }
        assert!(c.send(PipelineItem::Stop));

        let config = IngestConfig {
            batch_max: 1000,
            batch_timeout: Duration::ZERO,
            ..Default::default()
        };
        let stats = ingest(&store, &c, config).run();
        assert_eq!(stats.written, 3);
        assert_eq!(stats.batches, 3);
    }

    #[test]
    fn delete_policy_removes_history() {
        let (store, c) = setup();
        assert!(c.send(announce("10.0.0.0/24", 1, ValidityState::Valid)));
        assert!(c.send(announce("10.1.0.0/16", 1, ValidityState::Valid)));
        assert!(c.send(withdraw("10.0.0.0/24", 2)));
        assert!(c.send(PipelineItem::Stop));

        let config = IngestConfig {
            withdraw_policy: WithdrawPolicy::Delete,
            ..Default::default()
        };
        let stats = ingest(&store, &c, config).run();
        assert_eq!(stats.removed, 1);
        assert!(store
            .history(&prefix("10.0.0.0/24"))
            .expect("history")
            .is_empty());
        assert_eq!(store.record_count().expect("count"), 1);
    }

    #[test]
    fn closed_store_is_reconnected() {
        let (store, c) = setup();
        store.close();
        assert!(c.send(announce("10.0.0.0/24", 1, ValidityState::Valid)));
        assert!(c.send(PipelineItem::Stop));
        let stats = ingest(&store, &c, IngestConfig::default()).run();
        assert_eq!(stats.failed_batches, 0);
        assert_eq!(store.record_count().expect("count"), 1);
    }

    #[test]
    fn duties_run_once() {
        let (store, c) = setup();
        assert!(c.send(announce("10.0.0.0/24", 1, ValidityState::NotFound)));
        assert!(c.send(announce("10.0.0.0/24", 2, ValidityState::Valid)));
        assert!(c.send(PipelineItem::Stop));
        ingest(&store, &c, IngestConfig::default()).run();

        let worker = |duty| {
            PeriodicWorker::new(
                store.clone(),
                duty,
                PeriodicConfig::default(),
                discard_logger(),
            )
        };

        assert_eq!(
            worker(Duty::Stats).run_once().expect("stats"),
            DutyReport::Stats(None)
        );
        assert_eq!(
            worker(Duty::Compact).run_once().expect("compact"),
            DutyReport::Compacted(CompactionReport {
                prefixes: 1,
                removed: 0,
            })
        );
        let DutyReport::Stats(Some(snap)) =
            worker(Duty::Stats).run_once().expect("stats")
        else {
            panic!("expected a snapshot");
        };
        assert_eq!(snap.timestamp, 2);
        assert_eq!(snap.total.valid, 1);

        let archive = worker(Duty::Archive(ArchivePolicy::default()));
        assert_eq!(
            archive.run_once().expect("archive"),
            DutyReport::Archived(ArchiveReport {
                superseded: 1,
                notfound_purged: 0,
                stats_pruned: 0,
            })
        );
        let p = prefix("10.0.0.0/24");
        assert_eq!(store.history(&p).expect("history").len(), 1);
        assert_eq!(store.archived(&p).expect("archived").len(), 1);

        store.close();
        assert!(archive.run_once().is_err());
    }

    #[test]
    fn periodic_compaction_triggers_early_and_on_shutdown() {
        let (store, _) = setup();
        let record = |p: &str| {
            ValidityRecord::announcement(
                prefix(p),
                Asn(65001),
                1,
                Verdict::not_found(),
                None,
                None,
            )
        };
        store.ingest(&[record("10.0.0.0/24")]).expect("ingest");

        let config = PeriodicConfig {
            interval: Duration::from_secs(3600),
            poll: Duration::from_millis(10),
            early_after_records: Some(2),
        };
        let worker = PeriodicWorker::new(
            store.clone(),
            Duty::Compact,
            config,
            discard_logger(),
        );
        let thread =
            ManagedThread::spawn("compaction", Shutdown::new(), move |s| {
                worker.run(&s)
            })
            .expect("spawn");

        // The first cycle runs at start.
        wait_for_eq!(store.latest_all().expect("latest").len(), 1);

        store.ingest(&[record("10.1.0.0/24")]).expect("ingest");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.latest_all().expect("latest").len(), 1);

        store.ingest(&[record("10.2.0.0/24")]).expect("ingest");
        wait_for_eq!(store.latest_all().expect("latest").len(), 3);

        store.ingest(&[record("10.3.0.0/24")]).expect("ingest");
        thread.shutdown().trigger();
        assert!(thread.join());
        assert_eq!(store.latest_all().expect("latest").len(), 4);
    }
}
