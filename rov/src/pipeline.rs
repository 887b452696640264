// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages carried from validation to persistence, and their line format.
//!
//! Every message is one JSON object per line tagged by `type`. The literal
//! line `STOP` terminates a stream.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use vdb::{Asn, Prefix, Source, ValidityRecord, Verdict};

pub const STOP_LINE: &str = "STOP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: Prefix,
    pub origin_asn: Asn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRoute {
    pub route: Route,
    pub validity: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub prefix: Prefix,
    pub origin: Asn,
    #[serde(default)]
    pub source: Option<Source>,
    pub timestamp: i64,
    #[serde(default)]
    pub next_hop: Option<IpAddr>,
    pub validated_route: ValidatedRoute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdraw {
    pub prefix: Prefix,
    #[serde(default)]
    pub source: Option<Source>,
    pub timestamp: i64,
    #[serde(default)]
    pub next_hop: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineMessage {
    #[serde(rename = "announcement")]
    Announcement(Announcement),
    #[serde(rename = "withdraw")]
    Withdraw(Withdraw),
}

impl PipelineMessage {
    pub fn announcement(
        prefix: Prefix,
        origin: Asn,
        timestamp: i64,
        verdict: Verdict,
        next_hop: Option<IpAddr>,
        source: Option<Source>,
    ) -> Self {
        PipelineMessage::Announcement(Announcement {
            prefix,
            origin,
            source,
            timestamp,
            next_hop,
            validated_route: ValidatedRoute {
                route: Route {
                    prefix,
                    origin_asn: origin,
                },
                validity: verdict,
            },
        })
    }

    pub fn withdraw(
        prefix: Prefix,
        timestamp: i64,
        source: Option<Source>,
    ) -> Self {
        PipelineMessage::Withdraw(Withdraw {
            prefix,
            source,
            timestamp,
            next_hop: None,
        })
    }

    /// The record stored for this message.
    pub fn into_record(self) -> ValidityRecord {
        match self {
            PipelineMessage::Announcement(a) => ValidityRecord::announcement(
                a.prefix,
                a.origin,
                a.timestamp,
                a.validated_route.validity,
                a.next_hop,
                a.source,
            ),
            PipelineMessage::Withdraw(w) => {
                ValidityRecord::withdrawn(w.prefix, w.timestamp, w.source)
            }
        }
    }
}

/// An item on the pipeline: a message or the end of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineItem {
    Message(PipelineMessage),
    Stop,
}

impl PipelineItem {
    pub fn to_line(&self) -> Result<String, Error> {
        match self {
            PipelineItem::Message(m) => Ok(serde_json::to_string(m)?),
            PipelineItem::Stop => Ok(STOP_LINE.to_string()),
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, Error> {
        let line = line.trim();
        if line == STOP_LINE {
            return Ok(PipelineItem::Stop);
        }
        if line.is_empty() {
            return Err(Error::Line("empty line".into()));
        }
        Ok(PipelineItem::Message(serde_json::from_str(line)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use vdb::{EventType, ValidityState, Vrp, VrpBuckets};

    fn invalid_as() -> Verdict {
        Verdict {
            state: ValidityState::InvalidAs,
            vrps: Some(VrpBuckets {
                unmatched_as: vec![Vrp {
                    asn: Asn(65002),
                    prefix: "10.0.0.0/24".parse().expect("prefix"),
                    max_length: 24,
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn announcement_json_shape() {
        let msg = PipelineMessage::announcement(
            "10.0.0.0/24".parse().expect("prefix"),
            Asn(65001),
            1_700_000_000,
            invalid_as(),
            Some("192.0.2.1".parse().expect("ip")),
            None,
        );
        let line = PipelineItem::Message(msg.clone()).to_line().expect("line");
        let v: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(v["type"], "announcement");
        assert_eq!(v["prefix"], "10.0.0.0/24");
        assert_eq!(v["origin"], "AS65001");
        assert_eq!(v["timestamp"], 1_700_000_000);
        assert_eq!(v["validated_route"]["route"]["origin_asn"], "AS65001");
        assert_eq!(v["validated_route"]["validity"]["state"], "InvalidAS");
        assert_eq!(v["validated_route"]["validity"]["code"], 3);
        assert_eq!(
            v["validated_route"]["validity"]["VRPs"]["unmatched_as"][0]["asn"],
            "AS65002"
        );

        assert_eq!(PipelineItem::parse_line(&line).expect("parse"), PipelineItem::Message(msg));
    }

    #[test]
    fn withdraw_and_stop() {
        let line = r#"{"type":"withdraw","prefix":"2001:db8::/32","timestamp":42}"#;
        let item = PipelineItem::parse_line(line).expect("parse");
        let PipelineItem::Message(msg) = item else {
            panic!("expected message");
        };
        let record = msg.into_record();
        assert_eq!(record.event_type, EventType::Withdrawn);
        assert_eq!(record.verdict, None);
        assert_eq!(record.timestamp, 42);

        assert_eq!(PipelineItem::parse_line(" STOP ").expect("stop"), PipelineItem::Stop);
        assert_eq!(PipelineItem::Stop.to_line().expect("line"), "STOP");
    }

    #[test]
    fn rejects_malformed() {
        assert!(PipelineItem::parse_line("").is_err());
        assert!(PipelineItem::parse_line("{").is_err());
        assert!(PipelineItem::parse_line(r#"{"type":"update","prefix":"10.0.0.0/8","timestamp":1}"#).is_err());
        // Announcement whose validity name and code disagree.
        assert!(PipelineItem::parse_line(
            r#"{"type":"announcement","prefix":"10.0.0.0/8","origin":"AS1","timestamp":1,"validated_route":{"route":{"prefix":"10.0.0.0/8","origin_asn":"AS1"},"validity":{"state":"Valid","code":2,"description":""}}}"#
        )
        .is_err());
    }
}
