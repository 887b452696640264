// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded FIFO between the validators and the ingest worker.
//!
//! Depth above the high watermark raises a shared pause flag; producers
//! block while it is raised and the consumer lowers it once depth drops
//! below the low watermark. Items are never dropped.

use crate::log::rov_log;
use crate::pipeline::PipelineItem;
use rov_common::lock;
use slog::Logger;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

const MODULE: &str = crate::MOD_COORDINATOR;
const UNIT: &str = "queue";

pub const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Hard limit on queued items. Producers block here even if the pause
    /// flag is not raised.
    pub capacity: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl CoordinatorConfig {
    pub fn new(high_watermark: usize) -> Self {
        let high_watermark = high_watermark.max(1);
        Self {
            capacity: high_watermark.saturating_mul(2),
            high_watermark,
            low_watermark: high_watermark / 2,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK)
    }
}

/// The pause flag shared by every producer of a coordinator.
#[derive(Debug, Clone, Default)]
pub struct Backpressure(Arc<AtomicBool>);

impl Backpressure {
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, paused: bool) -> bool {
        self.0.swap(paused, Ordering::AcqRel) != paused
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<PipelineItem>,
    closed: bool,
}

struct Shared {
    config: CoordinatorConfig,
    queue: Mutex<Queue>,
    not_empty: Condvar,
    writable: Condvar,
    pause: Backpressure,
    log: Logger,
}

#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, log: Logger) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(Queue::default()),
                not_empty: Condvar::new(),
                writable: Condvar::new(),
                pause: Backpressure::default(),
                log,
            }),
        }
    }

    pub fn backpressure(&self) -> Backpressure {
        self.shared.pause.clone()
    }

    pub fn depth(&self) -> usize {
        lock!(self.shared.queue).items.len()
    }

    pub fn is_closed(&self) -> bool {
        lock!(self.shared.queue).closed
    }

    /// Enqueue an item, blocking while the queue is paused or full. `Stop`
    /// is accepted immediately. Returns false if the coordinator is closed.
    pub fn send(&self, item: PipelineItem) -> bool {
        let s = &self.shared;
        let mut q = lock!(s.queue);
        if item != PipelineItem::Stop {
            while !q.closed
                && (s.pause.is_paused() || q.items.len() >= s.config.capacity)
            {
                q = s.writable.wait(q).unwrap_or_else(PoisonError::into_inner);
            }
        }
        if q.closed {
            return false;
        }
        q.items.push_back(item);
        let depth = q.items.len();
        if depth > s.config.high_watermark && s.pause.set(true) {
            rov_log!(s, warn, "queue above high watermark, pausing producers";
                "depth" => depth
            );
        }
        s.not_empty.notify_one();
        true
    }

    fn pop(&self, q: &mut Queue) -> Option<PipelineItem> {
        let s = &self.shared;
        let item = q.items.pop_front()?;
        let depth = q.items.len();
        if depth < s.config.low_watermark && s.pause.is_paused() {
            s.pause.set(false);
            rov_log!(s, info, "queue below low watermark, resuming producers";
                "depth" => depth
            );
            s.writable.notify_all();
        } else if depth + 1 == s.config.capacity {
            s.writable.notify_one();
        }
        Some(item)
    }

    /// Dequeue the next item, blocking until one is available. Returns
    /// `None` once the coordinator is closed and drained.
    pub fn recv(&self) -> Option<PipelineItem> {
        let s = &self.shared;
        let mut q = lock!(s.queue);
        loop {
            if let Some(item) = self.pop(&mut q) {
                return Some(item);
            }
            if q.closed {
                return None;
            }
            q = s.not_empty.wait(q).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PipelineItem, RecvTimeoutError> {
        let s = &self.shared;
        let deadline = Instant::now() + timeout;
        let mut q = lock!(s.queue);
        loop {
            if let Some(item) = self.pop(&mut q) {
                return Ok(item);
            }
            if q.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvTimeoutError::Timeout);
            }
            q = s
                .not_empty
                .wait_timeout(q, deadline - now)
                .map(|(q, _)| q)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Refuse further items and wake every blocked producer and consumer.
    /// Items already queued can still be received.
    pub fn close(&self) {
        let s = &self.shared;
        lock!(s.queue).closed = true;
        s.pause.set(false);
        s.writable.notify_all();
        s.not_empty.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::PipelineMessage;
    use pretty_assertions::assert_eq;
    use rov_common::log::discard_logger;

    fn item(ts: i64) -> PipelineItem {
        PipelineItem::Message(PipelineMessage::withdraw(
            "10.0.0.0/8".parse().expect("prefix"),
            ts,
            None,
        ))
    }

    fn small() -> Coordinator {
        Coordinator::new(
            CoordinatorConfig {
                capacity: 16,
                high_watermark: 4,
                low_watermark: 2,
            },
            discard_logger(),
        )
    }

    #[test]
    fn fifo() {
        let c = small();
        for i in 0..3 {
            assert!(c.send(item(i)));
        }
        assert_eq!(c.recv(), Some(item(0)));
        assert_eq!(c.recv(), Some(item(1)));
        assert_eq!(c.recv_timeout(Duration::from_millis(10)), Ok(item(2)));
        assert_eq!(
            c.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn backpressure_watermarks() {
        let c = small();
        let pause = c.backpressure();
        for i in 0..4 {
            assert!(c.send(item(i)));
        }
        assert!(!pause.is_paused());
        assert!(c.send(item(4)));
        assert!(pause.is_paused());

        let producer = {
            let c = c.clone();
            std::thread::spawn(move || c.send(item(5)))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(c.depth(), 5);

        // Stop gets through while paused.
        assert!(c.send(PipelineItem::Stop));
        assert_eq!(c.depth(), 6);

        for i in 0..4 {
            assert_eq!(c.recv(), Some(item(i)));
            assert!(pause.is_paused());
        }
        assert_eq!(c.recv(), Some(item(4)));
        assert!(!pause.is_paused());

        assert!(producer.join().expect("producer"));
        assert_eq!(c.recv(), Some(PipelineItem::Stop));
        assert_eq!(c.recv(), Some(item(5)));
    }

    #[test]
    fn close_releases_blocked_producer() {
        let c = small();
        for i in 0..5 {
            assert!(c.send(item(i)));
        }
        let producer = {
            let c = c.clone();
            std::thread::spawn(move || c.send(item(5)))
        };
        rov_common::wait_for_eq!(c.backpressure().is_paused(), true);
        c.close();
        assert!(!producer.join().expect("producer"));
        assert!(!c.send(PipelineItem::Stop));

        // Already queued items drain before the closed signal.
        for i in 0..5 {
            assert_eq!(c.recv(), Some(item(i)));
        }
        assert_eq!(c.recv(), None);
        assert_eq!(
            c.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
    }
}
