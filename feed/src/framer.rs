// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reassembly of a continuous monitor byte stream into complete envelopes.
//!
//! [`Deframer`] is the I/O free reassembly state machine. [`FeedStream`]
//! drives it from a TCP connection that is re-established with jittered
//! exponential backoff whenever it fails, and [`ReaderFrames`] drives it from
//! any finite reader such as a recorded feed file.

use crate::log::feed_log;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rov_common::Shutdown;
use slog::Logger;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const MODULE: &str = crate::MOD_FRAMER;
const UNIT: &str = "stream";

pub const DEFAULT_DELIMITER: &str = "</BGP_MONITOR_MESSAGE>";
pub const DEFAULT_WRAPPER: &str = "<xml>";
pub const DEFAULT_MAX_BUFFER: usize = 16 << 20;
pub const DEFAULT_UPDATE_PORT: u16 = 50001;
pub const DEFAULT_RIB_PORT: u16 = 50002;

const READ_CHUNK: usize = 64 << 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramerConfig {
    pub host: String,
    pub port: u16,

    /// Token that closes every envelope.
    pub delimiter: String,

    /// Token opening the first segment of a connection, stripped once.
    pub wrapper: String,

    /// Upper bound on bytes buffered while waiting for a delimiter.
    pub max_buffer: usize,

    pub connect_timeout: Duration,

    /// Socket read timeout. Bounds how long shutdown requests go unnoticed.
    pub read_timeout: Duration,

    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl FramerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            delimiter: DEFAULT_DELIMITER.to_string(),
            wrapper: DEFAULT_WRAPPER.to_string(),
            max_buffer: DEFAULT_MAX_BUFFER,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(500),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }

    pub fn deframer(&self) -> Deframer {
        Deframer::new(
            self.delimiter.as_bytes(),
            self.wrapper.as_bytes(),
            self.max_buffer,
        )
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut b = ExponentialBackoff {
            initial_interval: self.backoff_initial,
            max_interval: self.backoff_max,
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: None,
            ..Default::default()
        };
        b.reset();
        b
    }
}

/// Delimiter based envelope reassembly.
///
/// Bytes are accumulated until the delimiter is seen; everything up to and
/// including the delimiter is emitted as one envelope and the remainder is
/// retained. The output is independent of how the input is split across
/// [`Deframer::push`] calls.
#[derive(Debug, Clone)]
pub struct Deframer {
    delimiter: Vec<u8>,
    wrapper: Vec<u8>,
    max_buffer: usize,
    buf: Vec<u8>,

    /// Offset in `buf` before which no delimiter can start.
    searched: usize,

    /// Still at the start of a connection, wrapper not yet ruled out.
    at_start: bool,

    /// The buffer overflowed; drop bytes through the next delimiter.
    resync: bool,

    overflows: u64,
}

impl Deframer {
    pub fn new(delimiter: &[u8], wrapper: &[u8], max_buffer: usize) -> Self {
        Self {
            delimiter: delimiter.to_vec(),
            wrapper: wrapper.to_vec(),
            max_buffer,
            buf: Vec::new(),
            searched: 0,
            at_start: true,
            resync: false,
            overflows: 0,
        }
    }

    /// Forget all buffered state, as for a fresh connection.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.searched = 0;
        self.at_start = true;
        self.resync = false;
    }

    /// Number of times the buffer limit was hit.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Bytes currently held waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed received bytes, returning every envelope they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        if self.at_start {
            if self.buf.len() < self.wrapper.len()
                && self.wrapper.starts_with(&self.buf)
            {
                return Vec::new();
            }
            if !self.wrapper.is_empty() && self.buf.starts_with(&self.wrapper)
            {
                self.buf.drain(..self.wrapper.len());
            }
            self.at_start = false;
        }

        let mut out = Vec::new();
        if self.delimiter.is_empty() {
            return out;
        }
        while let Some(pos) = self.find_delimiter() {
            let end = pos + self.delimiter.len();
            let envelope: Vec<u8> = self.buf.drain(..end).collect();
            self.searched = 0;
            if self.resync {
                self.resync = false;
                continue;
            }
            out.push(envelope);
        }

        if self.buf.len() > self.max_buffer {
            // Keep a possibly partial delimiter so resync ends at it.
            self.overflows += 1;
            let keep = self.delimiter.len() - 1;
            let cut = self.buf.len().saturating_sub(keep);
            self.buf.drain(..cut);
            self.searched = 0;
            self.resync = true;
        }
        out
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let d = self.delimiter.len();
        if self.buf.len() < d {
            return None;
        }
        let found = self.buf[self.searched..]
            .windows(d)
            .position(|w| w == self.delimiter.as_slice())
            .map(|p| p + self.searched);
        if found.is_none() {
            self.searched = self.buf.len() + 1 - d;
        }
        found
    }
}

/// Envelopes read from a live monitor connection. The iterator only ends
/// once shutdown has been requested; connection failures are retried
/// indefinitely.
pub struct FeedStream {
    config: FramerConfig,
    deframer: Deframer,
    conn: Option<TcpStream>,
    backoff: ExponentialBackoff,
    ready: VecDeque<Vec<u8>>,
    read_buf: Vec<u8>,
    reported_overflows: u64,
    shutdown: Shutdown,
    log: Logger,
}

impl FeedStream {
    pub fn new(config: FramerConfig, shutdown: Shutdown, log: Logger) -> Self {
        Self {
            deframer: config.deframer(),
            backoff: config.backoff(),
            conn: None,
            ready: VecDeque::new(),
            read_buf: vec![0u8; READ_CHUNK],
            reported_overflows: 0,
            config,
            shutdown,
            log,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn connect(&mut self) {
        match self.try_connect() {
            Ok(conn) => {
                feed_log!(self, info, "connected to route monitor";
                    "endpoint" => self.endpoint()
                );
                self.conn = Some(conn);
                self.deframer.reset();
                self.backoff.reset();
            }
            Err(e) => {
                feed_log!(self, warn, "connect failed: {e}";
                    "endpoint" => self.endpoint()
                );
                self.wait();
            }
        }
    }

    fn try_connect(&self) -> std::io::Result<TcpStream> {
        let mut last = std::io::Error::new(
            ErrorKind::NotFound,
            "host resolved to no addresses",
        );
        for addr in (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()?
        {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            {
                Ok(conn) => {
                    conn.set_read_timeout(Some(self.config.read_timeout))?;
                    return Ok(conn);
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    fn disconnect(&mut self, reason: &str) {
        feed_log!(self, warn, "connection lost: {reason}";
            "endpoint" => self.endpoint(),
            "buffered" => self.deframer.buffered()
        );
        self.conn = None;
        self.wait();
    }

    fn wait(&mut self) {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.backoff_max);
        feed_log!(self, debug, "reconnecting in {delay:?}");
        self.shutdown.sleep(delay);
    }
}

impl Iterator for FeedStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(envelope) = self.ready.pop_front() {
                return Some(envelope);
            }
            if self.shutdown.is_triggered() {
                return None;
            }
            let result = match self.conn.as_mut() {
                Some(conn) => conn.read(&mut self.read_buf),
                None => {
                    self.connect();
                    continue;
                }
            };
            match result {
                Ok(0) => self.disconnect("closed by peer"),
                Ok(n) => {
                    let envelopes = self.deframer.push(&self.read_buf[..n]);
                    self.ready.extend(envelopes);
                    if self.deframer.overflows() > self.reported_overflows {
                        self.reported_overflows = self.deframer.overflows();
                        feed_log!(self, warn,
                            "no delimiter within buffer limit, discarding";
                            "max_buffer" => self.config.max_buffer
                        );
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock
                            | ErrorKind::TimedOut
                            | ErrorKind::Interrupted
                    ) => {}
                Err(e) => self.disconnect(&e.to_string()),
            }
        }
    }
}

/// Envelopes from a finite reader. Trailing bytes without a delimiter are
/// dropped at end of input.
pub struct ReaderFrames<R: Read> {
    reader: R,
    deframer: Deframer,
    ready: VecDeque<Vec<u8>>,
    read_buf: Vec<u8>,
    done: bool,
    log: Logger,
}

impl<R: Read> ReaderFrames<R> {
    pub fn new(reader: R, deframer: Deframer, log: Logger) -> Self {
        Self {
            reader,
            deframer,
            ready: VecDeque::new(),
            read_buf: vec![0u8; READ_CHUNK],
            done: false,
            log,
        }
    }
}

impl<R: Read> Iterator for ReaderFrames<R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        const UNIT: &str = "reader";
        loop {
            if let Some(envelope) = self.ready.pop_front() {
                return Some(envelope);
            }
            if self.done {
                return None;
            }
            match self.reader.read(&mut self.read_buf) {
                Ok(0) => {
                    if self.deframer.buffered() > 0 {
                        feed_log!(self, debug, "dropping incomplete trailing envelope";
                            "bytes" => self.deframer.buffered()
                        );
                    }
                    self.done = true;
                }
                Ok(n) => {
                    let envelopes = self.deframer.push(&self.read_buf[..n]);
                    self.ready.extend(envelopes);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    feed_log!(self, error, "read failed: {e}");
                    self.done = true;
                }
            }
        }
    }
}
