// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker wiring shared by the subcommands.

use crate::cli::{FeedArgs, OracleArgs, StoreArgs, StoreKind, SyncMode};
use crate::log::rovd_log;
use anyhow::{Context, Result};
use chrono::Utc;
use feed::framer::{DEFAULT_DELIMITER, DEFAULT_MAX_BUFFER, DEFAULT_WRAPPER};
use feed::{
    Deframer, FeedReader, FeedRole, FeedStream, FramerConfig, ReaderFrames, RouteEvent,
    SyncGate, TimeWindow,
};
use rov::persist::{Duty, IngestWorker, PeriodicWorker};
use rov::{Coordinator, PipelineItem, Validator, Work};
use rov_common::{ManagedThread, Shutdown};
use slog::Logger;
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use vdb::{Db, MemStore, Prefix, ValidityStore};

const UNIT: &str = "wiring";

/// Bound of each channel feeding a validation worker.
pub const WORK_QUEUE: usize = 4096;

pub fn open_store(
    args: &StoreArgs,
    log: &Logger,
) -> Result<Arc<dyn ValidityStore>> {
    let store: Arc<dyn ValidityStore> = match args.backend {
        StoreKind::Sled => Arc::new(
            Db::new(&args.db_path, log.clone())
                .with_context(|| format!("open store at {}", args.db_path))?,
        ),
        StoreKind::Memory => Arc::new(MemStore::new(log.clone())),
    };
    rovd_log!(log, info, "store opened"; "backend" => store.backend());
    Ok(store)
}

enum FrameSource {
    Monitor(FramerConfig),
    File(File),
}

impl FrameSource {
    fn open(
        args: &FeedArgs,
        file: Option<&Path>,
        port: u16,
    ) -> Result<Self> {
        match file {
            Some(path) => File::open(path)
                .map(FrameSource::File)
                .with_context(|| format!("open feed file {}", path.display())),
            None => Ok(FrameSource::Monitor(FramerConfig::new(
                &args.bgpmon_host,
                port,
            ))),
        }
    }
}

fn spawn_reader<S>(
    name: &str,
    role: FeedRole,
    gate: Arc<SyncGate>,
    source: FrameSource,
    shutdown: &Shutdown,
    mut sink: S,
    log: &Logger,
) -> Result<ManagedThread>
where
    S: FnMut(RouteEvent) -> bool + Send + 'static,
{
    let log = log.new(slog::o!("reader" => name.to_string()));
    ManagedThread::spawn(name, shutdown.clone(), move |shutdown| {
        let reader = FeedReader::new(role, gate, log.clone())
            .with_shutdown(shutdown.clone());
        let stop = shutdown.clone();
        let sink = move |e: RouteEvent| !stop.is_triggered() && sink(e);
        match source {
            FrameSource::Monitor(config) => {
                reader.run(FeedStream::new(config, shutdown, log), sink);
            }
            FrameSource::File(file) => {
                let deframer = Deframer::new(
                    DEFAULT_DELIMITER.as_bytes(),
                    DEFAULT_WRAPPER.as_bytes(),
                    DEFAULT_MAX_BUFFER,
                );
                reader.run(ReaderFrames::new(file, deframer, log), sink);
            }
        }
    })
    .with_context(|| format!("spawn {name}"))
}

/// Start the feed readers for the configured synchronization mode. Each
/// reader hands its events to its own clone of `sink`.
pub fn start_feed<S>(
    args: &FeedArgs,
    shutdown: &Shutdown,
    sink: S,
    log: &Logger,
) -> Result<Vec<ManagedThread>>
where
    S: FnMut(RouteEvent) -> bool + Clone + Send + 'static,
{
    let update =
        FrameSource::open(args, args.feed_file.as_deref(), args.update_port)?;
    let mut readers = Vec::new();
    match args.sync {
        SyncMode::Markers => {
            let rib =
                FrameSource::open(args, args.rib_file.as_deref(), args.rib_port)?;
            let gate = Arc::new(SyncGate::new(log.clone()));
            readers.push(spawn_reader(
                "rib-reader",
                FeedRole::Snapshot,
                gate.clone(),
                rib,
                shutdown,
                sink.clone(),
                log,
            )?);
            readers.push(spawn_reader(
                "update-reader",
                FeedRole::Update,
                gate,
                update,
                shutdown,
                sink,
                log,
            )?);
        }
        SyncMode::Window => {
            let path = args
                .baseline_file
                .as_deref()
                .context("window synchronization needs --baseline-file")?;
            let baseline = FrameSource::open(args, Some(path), 0)?;
            let window =
                TimeWindow::new(args.cut(Utc::now()), args.window, args.settle);
            rovd_log!(log, info, "time window synchronization";
                "cut" => window.cut,
                "start" => window.start(),
                "settle_ms" => window.settle.as_millis() as u64
            );
            // The baseline reader opens the gate once it has settled.
            let gate = Arc::new(SyncGate::new(log.clone()));
            readers.push(spawn_reader(
                "baseline-reader",
                FeedRole::Baseline(window),
                gate.clone(),
                baseline,
                shutdown,
                sink.clone(),
                log,
            )?);
            readers.push(spawn_reader(
                "update-reader",
                FeedRole::Live(window),
                gate,
                update,
                shutdown,
                sink,
                log,
            )?);
        }
        SyncMode::None => {
            let gate = Arc::new(SyncGate::live(log.clone()));
            readers.push(spawn_reader(
                "update-reader",
                FeedRole::Update,
                gate,
                update,
                shutdown,
                sink,
                log,
            )?);
        }
    }
    Ok(readers)
}

/// Spreads route events over the validation workers. Every event of a
/// prefix goes to the same worker so per-prefix order is kept.
#[derive(Clone)]
pub struct Dispatcher {
    workers: Vec<SyncSender<Work>>,
}

impl Dispatcher {
    pub fn worker_for(&self, prefix: &Prefix) -> usize {
        let mut h = DefaultHasher::new();
        prefix.hash(&mut h);
        (h.finish() % self.workers.len() as u64) as usize
    }

    pub fn dispatch(&self, event: RouteEvent) -> bool {
        let i = self.worker_for(&event.prefix);
        self.workers[i].send(Work::Event(event)).is_ok()
    }
}

/// Start the validation workers. Their output goes to the coordinator;
/// their `Stop` does not, since the caller sends a single `Stop` once every
/// worker has finished.
pub fn start_validators(
    args: &OracleArgs,
    coordinator: &Coordinator,
    log: &Logger,
) -> Result<(Dispatcher, Vec<ManagedThread>)> {
    let mut workers = Vec::new();
    let mut threads = Vec::new();
    for i in 0..args.workers.max(1) {
        let (tx, rx) = std::sync::mpsc::sync_channel(WORK_QUEUE);
        let validator =
            Validator::new(args.config(), log.new(slog::o!("worker" => i)));
        let c = coordinator.clone();
        let name = format!("validator-{i}");
        threads.push(
            ManagedThread::spawn(&name, Shutdown::new(), move |_| {
                validator.run(rx, |item| match item {
                    PipelineItem::Stop => true,
                    item => c.send(item),
                });
            })
            .with_context(|| format!("spawn {name}"))?,
        );
        workers.push(tx);
    }
    Ok((Dispatcher { workers }, threads))
}

/// The ingest worker and the periodic duties over one store.
pub struct Persistence {
    ingest: ManagedThread,
    duties: Vec<ManagedThread>,
    duty_shutdown: Shutdown,
    log: Logger,
}

impl Persistence {
    pub fn start(
        store: Arc<dyn ValidityStore>,
        coordinator: Coordinator,
        args: &StoreArgs,
        log: &Logger,
    ) -> Result<Self> {
        let worker = IngestWorker::new(
            store.clone(),
            coordinator,
            args.ingest_config(),
            log.clone(),
        );
        let ingest = ManagedThread::spawn("ingest", Shutdown::new(), move |_| {
            worker.run();
        })
        .context("spawn ingest")?;

        let duty_shutdown = Shutdown::new();
        let mut duties = Vec::new();
        for (duty, config) in [
            (Duty::Compact, args.compaction_config()),
            (Duty::Stats, args.periodic_config()),
            (Duty::Archive(args.archive_policy()), args.periodic_config()),
        ] {
            let worker =
                PeriodicWorker::new(store.clone(), duty, config, log.clone());
            duties.push(
                ManagedThread::spawn(duty.name(), duty_shutdown.clone(), move |s| {
                    worker.run(&s)
                })
                .with_context(|| format!("spawn {}", duty.name()))?,
            );
        }

        Ok(Self {
            ingest,
            duties,
            duty_shutdown,
            log: log.clone(),
        })
    }

    /// Wait for ingest to see `Stop`, then stop the periodic duties.
    pub fn finish(self) {
        if !self.ingest.join() {
            rovd_log!(self.log, error, "ingest worker panicked");
        }
        self.duty_shutdown.trigger();
        for duty in self.duties {
            let name = duty.name().to_string();
            if !duty.join() {
                rovd_log!(self.log, error, "{name} worker panicked");
            }
        }
        rovd_log!(self.log, info, "persistence stopped");
    }
}

/// Hand every non-empty stdin line to `forward` on a detached thread until
/// it returns false or input ends, then call `end`.
pub fn pump_stdin<F, E>(mut forward: F, end: E, log: &Logger) -> Result<()>
where
    F: FnMut(&str) -> bool + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let log = log.clone();
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in BufReader::new(std::io::stdin()).lines() {
                match line {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => {
                        if !forward(&line) {
                            return;
                        }
                    }
                    Err(e) => {
                        rovd_log!(log, error, "stdin read failed: {e}");
                        break;
                    }
                }
            }
            end();
        })
        .context("spawn stdin reader")?;
    Ok(())
}
