// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::log::rov_log;
use crate::oracle::{decode_response, encode_request};
use crate::pipeline::{PipelineItem, PipelineMessage};
use crate::process::{OracleConfig, SupervisedProcess};
use feed::RouteEvent;
use slog::Logger;
use std::sync::mpsc::Receiver;
use vdb::{Asn, Prefix, ValidityState, Verdict};

const MODULE: &str = crate::MOD_VALIDATOR;
const UNIT: &str = "worker";

/// Input of a validation worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    Event(RouteEvent),
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    pub validated: u64,
    pub withdrawals: u64,
    pub dropped: u64,
    pub errors: u64,
}

/// Turns route events into pipeline messages, consulting the oracle for
/// every announcement.
pub struct Validator {
    process: SupervisedProcess,
    stats: ValidatorStats,
    log: Logger,
}

impl Validator {
    pub fn new(config: OracleConfig, log: Logger) -> Self {
        Self {
            process: SupervisedProcess::new(config, log.clone()),
            stats: ValidatorStats::default(),
            log,
        }
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    /// Ask the oracle about one route. Failure to reach the oracle at all
    /// is reported as a connection error verdict.
    pub fn validate(&mut self, prefix: &Prefix, origin: Asn) -> Verdict {
        let request = encode_request(prefix, origin);
        let verdict = match self.process.request(&request) {
            Ok(line) => {
                let verdict = decode_response(&line);
                if verdict.state == ValidityState::ErrorOutput {
                    rov_log!(self, warn, "undecodable oracle response";
                        "response" => line
                    );
                }
                verdict
            }
            Err(e) => {
                rov_log!(self, error, "oracle unavailable: {e}";
                    "prefix" => prefix.to_string(),
                    "origin" => origin.to_string()
                );
                Verdict::error(ValidityState::ErrorConnection)
            }
        };
        if verdict.state.is_error() {
            self.stats.errors += 1;
        }
        verdict
    }

    pub fn handle(&mut self, event: RouteEvent) -> Option<PipelineMessage> {
        if !event.is_announcement() {
            self.stats.withdrawals += 1;
            return Some(PipelineMessage::withdraw(
                event.prefix,
                event.timestamp,
                event.source,
            ));
        }
        let Some(origin) = event.origin_as() else {
            rov_log!(self, debug, "announcement without origin dropped";
                "prefix" => event.prefix.to_string()
            );
            self.stats.dropped += 1;
            return None;
        };
        let verdict = self.validate(&event.prefix, origin);
        self.stats.validated += 1;
        Some(PipelineMessage::announcement(
            event.prefix,
            origin,
            event.timestamp,
            verdict,
            event.next_hop,
            event.source,
        ))
    }

    /// Validate work items until `Stop` arrives or every sender is gone,
    /// then stop the oracle and pass `Stop` downstream. A sink returning
    /// false ends the loop early.
    pub fn run<F>(mut self, work: Receiver<Work>, mut sink: F) -> ValidatorStats
    where
        F: FnMut(PipelineItem) -> bool,
    {
        rov_log!(self, info, "validator started");
        while let Ok(Work::Event(event)) = work.recv() {
            if let Some(msg) = self.handle(event) {
                if !sink(PipelineItem::Message(msg)) {
                    rov_log!(self, warn, "pipeline closed, validator stopping");
                    break;
                }
            }
        }
        self.process.stop();
        sink(PipelineItem::Stop);
        rov_log!(self, info, "validator finished";
            "validated" => self.stats.validated,
            "withdrawals" => self.stats.withdrawals,
            "dropped" => self.stats.dropped,
            "errors" => self.stats.errors,
            "restarts" => self.process.restarts()
        );
        self.stats
    }
}
