// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker thread management with consistent shutdown handling.

use crate::lock;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Granularity at which [`Shutdown::sleep`] re-checks the flag.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// A cloneable shutdown signal shared by a set of workers.
///
/// Every long running loop in the pipeline is handed one of these at
/// construction time and checks it between units of work.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown of every worker holding a clone of this signal.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for up to `d`, waking early when shutdown is requested. Returns
    /// true if shutdown was requested.
    pub fn sleep(&self, d: Duration) -> bool {
        let deadline = Instant::now() + d;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Status of a managed worker thread.
#[derive(Debug, Default)]
pub enum ThreadState {
    /// Thread has not been started or has already been joined.
    #[default]
    Ready,
    /// Thread is running with the given handle.
    Running(JoinHandle<()>),
}

impl ThreadState {
    pub fn is_running(&self) -> bool {
        match self {
            ThreadState::Running(h) => !h.is_finished(),
            ThreadState::Ready => false,
        }
    }
}

/// A named worker thread bundled with the shutdown signal it observes.
///
/// Dropping a `ManagedThread` triggers its shutdown signal and joins the
/// thread, so the worker never outlives its owner. Not `Clone`; wrap in `Arc`
/// if it must be shared.
#[derive(Debug)]
pub struct ManagedThread {
    name: String,
    state: Mutex<ThreadState>,
    shutdown: Shutdown,
}

impl ManagedThread {
    /// Spawn `f` on a new thread called `name`. The closure receives a clone
    /// of `shutdown` which it is expected to poll.
    pub fn spawn<F>(
        name: &str,
        shutdown: Shutdown,
        f: F,
    ) -> Result<Self, std::io::Error>
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let s = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(s))?;
        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(ThreadState::Running(handle)),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Check if the thread is currently running.
    pub fn is_running(&self) -> bool {
        lock!(self.state).is_running()
    }

    /// Wait for the thread to exit without triggering shutdown. Returns false
    /// if the thread panicked.
    pub fn join(self) -> bool {
        let state = std::mem::take(&mut *lock!(self.state));
        match state {
            ThreadState::Running(handle) => handle.join().is_ok(),
            ThreadState::Ready => true,
        }
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        let mut state = lock!(self.state);
        if let ThreadState::Running(handle) = std::mem::take(&mut *state) {
            drop(state);
            self.shutdown.trigger();
            let _ = handle.join();
        }
    }
}
