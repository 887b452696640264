// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::envelope::{Envelope, EnvelopeParser};
use crate::event::RouteEvent;
use crate::log::feed_log;
use crate::sync::{SyncGate, SyncState, TimeWindow};
use rov_common::Shutdown;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

const MODULE: &str = crate::MOD_SYNC;
const UNIT: &str = "reader";

/// How often a live reader holding events re-checks the gate once its own
/// input has ended.
const LIVE_POLL: Duration = Duration::from_millis(100);

/// Which stream a reader consumes, and so how its envelopes are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRole {
    /// Table snapshot stream with start/stop markers.
    Snapshot,
    /// Live update stream.
    Update,
    /// Historical replay serving as the baseline of a time window. Opens
    /// the gate once its input ends and the settling delay has passed.
    Baseline(TimeWindow),
    /// Live update stream starting at the cut of a time window. Events are
    /// held until the gate opens.
    Live(TimeWindow),
}

impl FeedRole {
    fn name(&self) -> &'static str {
        match self {
            FeedRole::Snapshot => "snapshot",
            FeedRole::Update => "update",
            FeedRole::Baseline(_) => "baseline",
            FeedRole::Live(_) => "live",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub envelopes: u64,
    pub discarded: u64,
    pub events: u64,
    /// Live events that had to wait for the baseline.
    pub held: u64,
}

/// Parses framed envelopes, gates them through the synchronizer and hands
/// the surviving route events to a sink.
pub struct FeedReader {
    role: FeedRole,
    parser: EnvelopeParser,
    gate: Arc<SyncGate>,
    shutdown: Shutdown,
    log: Logger,
}

impl FeedReader {
    pub fn new(role: FeedRole, gate: Arc<SyncGate>, log: Logger) -> Self {
        Self {
            role,
            parser: EnvelopeParser::new(log.clone()),
            gate,
            shutdown: Shutdown::new(),
            log,
        }
    }

    /// Observe `shutdown` while waiting on the gate or the settling delay.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn gate(
        &self,
        envelope: Envelope,
        held: &mut Vec<RouteEvent>,
        stats: &mut ReaderStats,
    ) -> Vec<RouteEvent> {
        match self.role {
            FeedRole::Snapshot => self.gate.on_snapshot(envelope),
            FeedRole::Update => self.gate.on_update(envelope),
            FeedRole::Baseline(w) => w.baseline(envelope),
            FeedRole::Live(w) => {
                let events = w.live(envelope);
                if self.gate.state() != SyncState::Live {
                    if held.is_empty() && !events.is_empty() {
                        feed_log!(self, info, "holding live events until baseline completes");
                    }
                    stats.held += events.len() as u64;
                    held.extend(events);
                    return Vec::new();
                }
                let mut out = std::mem::take(held);
                out.extend(events);
                out
            }
        }
    }

    /// The baseline input has ended: wait out the settling delay, then let
    /// the live stream through.
    fn settle(&self, window: &TimeWindow) {
        feed_log!(self, info, "baseline complete, settling";
            "settle_ms" => window.settle.as_millis() as u64
        );
        if self.shutdown.sleep(window.settle) {
            feed_log!(self, info, "shutdown while settling");
            return;
        }
        self.gate.advance(SyncState::Live);
    }

    /// Block until the gate opens. Returns false on shutdown.
    fn wait_live(&self) -> bool {
        while self.gate.state() != SyncState::Live {
            if self.shutdown.sleep(LIVE_POLL) {
                return false;
            }
        }
        true
    }

    /// Consume `frames` until they end or the sink refuses an event by
    /// returning false.
    pub fn run<I, F>(&self, frames: I, mut sink: F) -> ReaderStats
    where
        I: IntoIterator<Item = Vec<u8>>,
        F: FnMut(RouteEvent) -> bool,
    {
        let mut stats = ReaderStats::default();
        let mut held = Vec::new();
        feed_log!(self, info, "reader started"; "role" => self.role.name());
        if let FeedRole::Baseline(_) = self.role {
            self.gate.advance(SyncState::BaselineLoading);
        }

        let mut open = true;
        'frames: for frame in frames {
            stats.envelopes += 1;
            let Some(envelope) = self.parser.parse(&frame) else {
                stats.discarded += 1;
                continue;
            };
            for event in self.gate(envelope, &mut held, &mut stats) {
                stats.events += 1;
                if !sink(event) {
                    feed_log!(self, info, "sink closed, reader stopping";
                        "role" => self.role.name()
                    );
                    open = false;
                    break 'frames;
                }
            }
        }

        if open {
            match self.role {
                FeedRole::Baseline(w) => self.settle(&w),
                FeedRole::Live(_) if !held.is_empty() => {
                    if self.wait_live() {
                        for event in held.drain(..) {
                            stats.events += 1;
                            if !sink(event) {
                                break;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        feed_log!(self, info, "reader finished";
            "role" => self.role.name(),
            "envelopes" => stats.envelopes,
            "discarded" => stats.discarded,
            "events" => stats.events,
            "held" => stats.held
        );
        stats
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rov_common::log::discard_logger;
    use std::sync::mpsc;
    use std::time::Instant;

    fn frame_at(ts: i64, payload: &str) -> Vec<u8> {
        format!(
            "<BGP_MONITOR_MESSAGE><OBSERVED_TIME><TIMESTAMP>{ts}</TIMESTAMP></OBSERVED_TIME>{payload}</BGP_MONITOR_MESSAGE>"
        )
        .into_bytes()
    }

    fn frame(payload: &str) -> Vec<u8> {
        frame_at(100, payload)
    }

    fn route_at(ts: i64, prefix: &str) -> Vec<u8> {
        frame_at(
            ts,
            &format!("<UPDATE><AS_PATH><ASN2>65001</ASN2></AS_PATH><NLRI>{prefix}</NLRI></UPDATE>"),
        )
    }

    #[test]
    fn snapshot_then_update() {
        let gate = Arc::new(SyncGate::new(discard_logger()));
        let snapshot =
            FeedReader::new(FeedRole::Snapshot, gate.clone(), discard_logger());
        let update =
            FeedReader::new(FeedRole::Update, gate.clone(), discard_logger());

        let mut seen = Vec::new();
        let route = "<UPDATE><AS_PATH><ASN2>65001</ASN2></AS_PATH><NLRI>10.0.0.0/8</NLRI></UPDATE>";

        update.run(vec![frame(route)], |e| {
            seen.push(e);
            true
        });
        assert!(seen.is_empty());

        let stats = snapshot.run(
            vec![
                frame("<TABLE_START/>"),
                frame(route),
                b"garbage".to_vec(),
                frame("<TABLE_STOP/>"),
            ],
            |e| {
                seen.push(e);
                true
            },
        );
        assert_eq!(stats.envelopes, 4);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.events, 1);
        assert_eq!(gate.state(), SyncState::Live);

        update.run(vec![frame(route)], |e| {
            seen.push(e);
            true
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(gate.suppressed(), 1);
    }

    #[test]
    fn sink_refusal_stops_reader() {
        let gate = Arc::new(SyncGate::live(discard_logger()));
        let reader = FeedReader::new(FeedRole::Update, gate, discard_logger());
        let route = frame("<UPDATE><NLRI>10.0.0.0/8</NLRI><NLRI>10.1.0.0/16</NLRI></UPDATE>");
        let stats = reader.run(vec![route.clone(), route], |_| false);
        assert_eq!(stats.envelopes, 1);
        assert_eq!(stats.events, 1);
    }

    #[test]
    fn window_live_held_until_baseline_settles() {
        let gate = Arc::new(SyncGate::new(discard_logger()));
        let window = TimeWindow::new(
            1000,
            Duration::from_secs(500),
            Duration::from_millis(100),
        );
        let (seen_tx, seen_rx) = mpsc::channel();

        let (frames_tx, frames_rx) = mpsc::channel();
        let live =
            FeedReader::new(FeedRole::Live(window), gate.clone(), discard_logger());
        let live_seen = seen_tx.clone();
        let handle = std::thread::spawn(move || {
            live.run(frames_rx, |e| live_seen.send(e).is_ok())
        });

        frames_tx.send(route_at(1200, "10.9.0.0/16")).expect("send");
        frames_tx.send(route_at(900, "10.8.0.0/16")).expect("send");
        std::thread::sleep(Duration::from_millis(100));
        assert!(seen_rx.try_recv().is_err());
        assert_eq!(gate.state(), SyncState::WaitingForBaseline);

        let baseline = FeedReader::new(
            FeedRole::Baseline(window),
            gate.clone(),
            discard_logger(),
        );
        let started = Instant::now();
        let stats = baseline.run(
            vec![route_at(400, "10.0.0.0/8"), route_at(800, "10.1.0.0/16")],
            |e| seen_tx.send(e).is_ok(),
        );
        assert!(started.elapsed() >= window.settle);
        assert_eq!(stats.events, 1);
        assert_eq!(gate.state(), SyncState::Live);

        frames_tx.send(route_at(1300, "10.10.0.0/16")).expect("send");
        drop(frames_tx);
        let stats = handle.join().expect("live reader");
        assert_eq!(stats.held, 1);
        assert_eq!(stats.events, 2);

        let order: Vec<String> =
            seen_rx.try_iter().map(|e| e.prefix.to_string()).collect();
        assert_eq!(order, vec!["10.1.0.0/16", "10.9.0.0/16", "10.10.0.0/16"]);
    }

    #[test]
    fn held_events_dropped_on_shutdown() {
        let gate = Arc::new(SyncGate::new(discard_logger()));
        let window =
            TimeWindow::new(1000, Duration::from_secs(500), Duration::ZERO);
        let shutdown = Shutdown::new();
        let live =
            FeedReader::new(FeedRole::Live(window), gate, discard_logger())
                .with_shutdown(shutdown.clone());
        let handle = std::thread::spawn(move || {
            let mut seen = 0;
            let stats = live.run(vec![route_at(1200, "10.9.0.0/16")], |_| {
                seen += 1;
                true
            });
            (stats, seen)
        });
        std::thread::sleep(Duration::from_millis(150));
        shutdown.trigger();
        let (stats, seen) = handle.join().expect("live reader");
        assert_eq!(stats.held, 1);
        assert_eq!(seen, 0);
    }
}
