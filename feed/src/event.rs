// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use vdb::{Asn, Prefix, Source};

/// Marker line that terminates a stream of feed lines.
pub const STOP_LINE: &str = "STOP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteEventKind {
    #[serde(rename = "announcement")]
    Announcement,
    #[serde(rename = "withdraw")]
    Withdrawal,
}

/// A normalized routing event as learned from the route monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEvent {
    #[serde(rename = "type")]
    pub kind: RouteEventKind,

    /// Seconds since the epoch, as observed by the monitor.
    pub timestamp: i64,

    /// Peer that emitted the event. Absent for synthetic feeds.
    #[serde(default)]
    pub source: Option<Source>,

    #[serde(default)]
    pub next_hop: Option<IpAddr>,

    pub prefix: Prefix,

    /// AS path in order from the monitored peer towards the origin. Members
    /// of AS sets are never included.
    #[serde(default)]
    pub as_path: Vec<Asn>,
}

impl RouteEvent {
    pub fn announcement(
        prefix: Prefix,
        timestamp: i64,
        as_path: Vec<Asn>,
        next_hop: Option<IpAddr>,
        source: Option<Source>,
    ) -> Self {
        Self {
            kind: RouteEventKind::Announcement,
            timestamp,
            source,
            next_hop,
            prefix,
            as_path,
        }
    }

    pub fn withdrawal(
        prefix: Prefix,
        timestamp: i64,
        source: Option<Source>,
    ) -> Self {
        Self {
            kind: RouteEventKind::Withdrawal,
            timestamp,
            source,
            next_hop: None,
            prefix,
            as_path: Vec::new(),
        }
    }

    pub fn is_announcement(&self) -> bool {
        self.kind == RouteEventKind::Announcement
    }

    /// The origin AS is the last hop of the path. Withdrawals and
    /// announcements with an empty path have none.
    pub fn origin_as(&self) -> Option<Asn> {
        match self.kind {
            RouteEventKind::Announcement => self.as_path.last().copied(),
            RouteEventKind::Withdrawal => None,
        }
    }
}

/// One line of the route event stream exchanged between stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLine {
    Event(RouteEvent),
    Stop,
}

impl FeedLine {
    pub fn to_line(&self) -> Result<String, Error> {
        match self {
            FeedLine::Event(e) => Ok(serde_json::to_string(e)?),
            FeedLine::Stop => Ok(STOP_LINE.to_string()),
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, Error> {
        let line = line.trim();
        if line == STOP_LINE {
            return Ok(FeedLine::Stop);
        }
        if line.is_empty() {
            return Err(Error::Line("empty line".into()));
        }
        Ok(FeedLine::Event(serde_json::from_str(line)?))
    }
}
