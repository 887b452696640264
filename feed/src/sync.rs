// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequencing of the table snapshot and live update streams.
//!
//! Updates are held back until a complete baseline has been forwarded, so
//! validation never runs against a known-incomplete table.

use crate::envelope::Envelope;
use crate::event::RouteEvent;
use crate::log::feed_log;
use slog::Logger;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

const MODULE: &str = crate::MOD_SYNC;
const UNIT: &str = "gate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SyncState {
    WaitingForBaseline = 0,
    BaselineLoading = 1,
    Live = 2,
}

impl From<u8> for SyncState {
    fn from(v: u8) -> Self {
        match v {
            0 => SyncState::WaitingForBaseline,
            1 => SyncState::BaselineLoading,
            _ => SyncState::Live,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::WaitingForBaseline => write!(f, "waiting for baseline"),
            SyncState::BaselineLoading => write!(f, "baseline loading"),
            SyncState::Live => write!(f, "live"),
        }
    }
}

/// Synchronization state shared by the snapshot and update readers. The
/// state only ever moves forward.
pub struct SyncGate {
    state: AtomicU8,
    suppressed: AtomicU64,
    log: Logger,
}

impl SyncGate {
    pub fn new(log: Logger) -> Self {
        Self {
            state: AtomicU8::new(SyncState::WaitingForBaseline as u8),
            suppressed: AtomicU64::new(0),
            log,
        }
    }

    /// A gate that forwards updates immediately.
    pub fn live(log: Logger) -> Self {
        let gate = Self::new(log);
        gate.advance(SyncState::Live);
        gate
    }

    pub fn state(&self) -> SyncState {
        SyncState::from(self.state.load(Ordering::Acquire))
    }

    /// Move to `to` unless already there or beyond.
    pub fn advance(&self, to: SyncState) {
        let prev = SyncState::from(self.state.fetch_max(to as u8, Ordering::AcqRel));
        if prev < to {
            feed_log!(self, info, "sync state {prev} -> {to}";
                "suppressed" => self.suppressed()
            );
        }
    }

    /// Number of update events dropped because they arrived before the
    /// baseline was complete.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Handle an envelope from the snapshot stream. Table markers drive the
    /// state machine; route events are forwarded as announcements once the
    /// table transfer has begun.
    pub fn on_snapshot(&self, envelope: Envelope) -> Vec<RouteEvent> {
        match envelope {
            Envelope::Keepalive => Vec::new(),
            Envelope::TableStart => {
                if self.state() == SyncState::WaitingForBaseline {
                    self.advance(SyncState::BaselineLoading);
                }
                Vec::new()
            }
            Envelope::TableStop => {
                if self.state() == SyncState::BaselineLoading {
                    self.advance(SyncState::Live);
                }
                Vec::new()
            }
            Envelope::Update(events) => {
                if self.state() == SyncState::WaitingForBaseline {
                    feed_log!(self, debug, "snapshot events before table start";
                        "dropped" => events.len()
                    );
                    return Vec::new();
                }
                events.into_iter().filter(|e| e.is_announcement()).collect()
            }
        }
    }

    /// Handle an envelope from the update stream. Route events pass through
    /// unchanged once live and are dropped and counted before that.
    pub fn on_update(&self, envelope: Envelope) -> Vec<RouteEvent> {
        let events = envelope.into_events();
        if self.state() == SyncState::Live {
            return events;
        }
        self.suppressed
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Vec::new()
    }
}

/// Time windowed synchronization: a historical window of update records
/// before `cut` serves as the baseline, and the live stream starts at `cut`
/// after a settling delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Cut point, seconds since the epoch.
    pub cut: i64,
    pub window: Duration,
    pub settle: Duration,
}

impl TimeWindow {
    pub fn new(cut: i64, window: Duration, settle: Duration) -> Self {
        Self {
            cut,
            window,
            settle,
        }
    }

    pub fn start(&self) -> i64 {
        let window = i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX);
        self.cut.saturating_sub(window)
    }

    /// Baseline events: announcements in `[cut - window, cut)`. Historical
    /// withdrawals are dropped.
    pub fn baseline(&self, envelope: Envelope) -> Vec<RouteEvent> {
        let start = self.start();
        envelope
            .into_events()
            .into_iter()
            .filter(|e| {
                e.is_announcement() && e.timestamp >= start && e.timestamp < self.cut
            })
            .collect()
    }

    /// Live events: everything stamped at or after the cut.
    pub fn live(&self, envelope: Envelope) -> Vec<RouteEvent> {
        envelope
            .into_events()
            .into_iter()
            .filter(|e| e.timestamp >= self.cut)
            .collect()
    }
}
