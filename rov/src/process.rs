// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervision of the long lived oracle subprocess.

use crate::error::Error;
use crate::log::rov_log;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::Logger;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

const MODULE: &str = crate::MOD_VALIDATOR;
const UNIT: &str = "process";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleConfig {
    pub program: PathBuf,
    pub args: Vec<String>,

    /// How long to wait for one response line.
    pub response_timeout: Duration,

    /// Attempts per request, each against a fresh process after a failure.
    pub max_attempts: u32,

    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
}

impl OracleConfig {
    /// The oracle is invoked as `<program> <cache-host> <cache-port>`.
    pub fn new(program: impl Into<PathBuf>, cache_host: &str, cache_port: u16) -> Self {
        Self::with_args(
            program,
            vec![cache_host.to_string(), cache_port.to_string()],
        )
    }

    pub fn with_args(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            response_timeout: Duration::from_secs(30),
            max_attempts: 3,
            restart_backoff: Duration::from_millis(500),
            restart_backoff_max: Duration::from_secs(10),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut b = ExponentialBackoff {
            initial_interval: self.restart_backoff,
            max_interval: self.restart_backoff_max,
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: None,
            ..Default::default()
        };
        b.reset();
        b
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not yet spawned, or being spawned.
    Starting,
    /// Running and answering requests.
    Ready,
    /// Exited, killed or failed to spawn. The next request restarts it.
    Dead,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
    reader: JoinHandle<()>,
}

/// The oracle subprocess together with its restart policy. Requests are
/// strictly one line out, one line in.
pub struct SupervisedProcess {
    config: OracleConfig,
    state: ProcessState,
    running: Option<Running>,
    spawns: u64,
    log: Logger,
}

impl SupervisedProcess {
    pub fn new(config: OracleConfig, log: Logger) -> Self {
        Self {
            config,
            state: ProcessState::Starting,
            running: None,
            spawns: 0,
            log,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Number of times the process has been restarted after the first
    /// spawn.
    pub fn restarts(&self) -> u64 {
        self.spawns.saturating_sub(1)
    }

    /// Spawn the process if it is not running.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state == ProcessState::Ready {
            return Ok(());
        }
        self.state = ProcessState::Starting;
        match self.spawn() {
            Ok(running) => {
                rov_log!(self, info, "oracle started";
                    "program" => self.config.program.display().to_string(),
                    "pid" => running.child.id()
                );
                self.running = Some(running);
                self.spawns += 1;
                self.state = ProcessState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = ProcessState::Dead;
                Err(e)
            }
        }
    }

    fn spawn(&self) -> Result<Running, Error> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::ProcessExited(
                    "oracle pipes unavailable".into(),
                ));
            }
        };

        let (tx, lines) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("oracle-reader".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Running {
            child,
            stdin,
            lines,
            reader,
        })
    }

    /// Kill the process if running and mark it dead.
    pub fn stop(&mut self) {
        if let Some(mut r) = self.running.take() {
            let _ = r.child.kill();
            let status = r.child.wait();
            drop(r.stdin);
            let _ = r.reader.join();
            rov_log!(self, info, "oracle stopped";
                "status" => format!("{status:?}")
            );
        }
        self.state = ProcessState::Dead;
    }

    fn exchange(&mut self, request: &str) -> Result<String, Error> {
        let running = self
            .running
            .as_mut()
            .ok_or(Error::ProcessExited("not running".into()))?;
        running.stdin.write_all(request.as_bytes())?;
        running.stdin.flush()?;
        match running.lines.recv_timeout(self.config.response_timeout) {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(e)) => Err(e.into()),
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::Timeout(self.config.response_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = running.child.try_wait();
                Err(Error::ProcessExited(format!(
                    "output closed, status {status:?}"
                )))
            }
        }
    }

    /// Send one request line and return the response line. A failed
    /// exchange kills the process; the request is then retried against a
    /// fresh one, up to the configured number of attempts.
    pub fn request(&mut self, request: &str) -> Result<String, Error> {
        let mut backoff = self.config.backoff();
        let attempts = self.config.max_attempts.max(1);
        let mut last = Error::ProcessExited("no attempt made".into());

        for attempt in 1..=attempts {
            if self.state != ProcessState::Ready {
                if let Err(e) = self.start() {
                    rov_log!(self, error, "oracle spawn failed: {e}";
                        "attempt" => attempt
                    );
                    last = e;
                    self.pause(&mut backoff, attempt, attempts);
                    continue;
                }
            }
            match self.exchange(request) {
                Ok(line) => return Ok(line),
                Err(e) => {
                    rov_log!(self, warn, "oracle exchange failed: {e}";
                        "attempt" => attempt,
                        "request" => request.trim_end()
                    );
                    self.stop();
                    last = e;
                    self.pause(&mut backoff, attempt, attempts);
                }
            }
        }
        Err(last)
    }

    fn pause(&self, backoff: &mut ExponentialBackoff, attempt: u32, of: u32) {
        if attempt < of {
            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.restart_backoff_max);
            std::thread::sleep(delay);
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.stop();
    }
}
