// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of BGPmon XML envelopes into route events.
//!
//! Element names are matched on their local part so both the
//! `bgp_monitor` and `xfb` namespaces are accepted without prefixes.

use crate::error::Error;
use crate::event::RouteEvent;
use crate::log::feed_log;
use itertools::Itertools;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use slog::Logger;
use std::net::IpAddr;
use vdb::{Asn, Prefix, Source};

const MODULE: &str = crate::MOD_PARSER;
const UNIT: &str = "envelope";

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Keepalive,
    TableStart,
    TableStop,
    /// Withdrawals first, then announcements, each in document order.
    Update(Vec<RouteEvent>),
}

impl Envelope {
    pub fn into_events(self) -> Vec<RouteEvent> {
        match self {
            Envelope::Update(events) => events,
            _ => Vec::new(),
        }
    }
}

/// Fields collected while walking the document.
#[derive(Default)]
struct Fields {
    source_addr: Option<String>,
    source_port: Option<String>,
    source_asn: Option<String>,
    timestamp: Option<String>,
    keepalive: bool,
    table_start: bool,
    table_stop: bool,
    update: bool,
    withdrawn: Vec<String>,
    announced: Vec<String>,
    as_path: Vec<String>,
    next_hop: Option<String>,
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn is_as_set(e: &BytesStart) -> Result<bool, Error> {
    if local_name(e) == "AS_SET" {
        return Ok(true);
    }
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == b"type"
            && attr.value.as_ref() == b"AS_SET"
        {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Fields {
    fn mark(&mut self, name: &str) {
        match name {
            "KEEP_ALIVE" => self.keepalive = true,
            "TABLE_START" => self.table_start = true,
            "TABLE_STOP" => self.table_stop = true,
            "UPDATE" => self.update = true,
            _ => {}
        }
    }

    fn text(&mut self, path: &[String], in_as_set: bool, text: String) {
        let Some((leaf, ancestors)) = path.split_last() else {
            return;
        };
        let parent = ancestors.last().map(String::as_str);
        let within = |name: &str| ancestors.iter().any(|a| a == name);
        match (leaf.as_str(), parent) {
            ("ADDRESS", Some("SOURCE")) => self.source_addr = Some(text),
            ("PORT", Some("SOURCE")) => self.source_port = Some(text),
            ("ASN2" | "ASN4", Some("SOURCE")) => self.source_asn = Some(text),
            ("TIMESTAMP", Some("OBSERVED_TIME")) => self.timestamp = Some(text),
            ("ASN2" | "ASN4", _) if within("AS_PATH") && !in_as_set => {
                self.as_path.push(text)
            }
            ("WITHDRAW", _) if within("UPDATE") => self.withdrawn.push(text),
            ("NLRI", _) if within("UPDATE") => self.announced.push(text),
            ("NEXT_HOP", _) if within("UPDATE") && self.next_hop.is_none() => {
                self.next_hop = Some(text)
            }
            _ => {}
        }
    }

    fn source(&self) -> Result<Option<Source>, Error> {
        let Some(addr) = &self.source_addr else {
            return Ok(None);
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| {
            Error::Malformed(format!("bad source address '{addr}'"))
        })?;
        let port = match &self.source_port {
            Some(p) => p.trim().parse().map_err(|_| {
                Error::Malformed(format!("bad source port '{p}'"))
            })?,
            None => 0,
        };
        let asn = match &self.source_asn {
            Some(a) => a.parse().map_err(Error::Malformed)?,
            None => Asn(0),
        };
        Ok(Some(Source { addr, port, asn }))
    }

    fn into_envelope(self) -> Result<Envelope, Error> {
        if self.keepalive {
            return Ok(Envelope::Keepalive);
        }
        if self.table_start {
            return Ok(Envelope::TableStart);
        }
        if self.table_stop {
            return Ok(Envelope::TableStop);
        }
        if !self.update {
            return Err(Error::Malformed("no update".into()));
        }

        let source = self.source()?;
        let timestamp: i64 = self
            .timestamp
            .as_deref()
            .ok_or(Error::Malformed("no observed time".into()))?
            .trim()
            .parse()
            .map_err(|_| Error::Malformed("bad observed time".into()))?;
        let as_path = self
            .as_path
            .iter()
            .map(|a| a.parse::<Asn>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Malformed)?;
        let next_hop = match &self.next_hop {
            Some(nh) => Some(nh.trim().parse::<IpAddr>().map_err(|_| {
                Error::Malformed(format!("bad next hop '{nh}'"))
            })?),
            None => None,
        };
        let parse_prefixes = |v: &[String]| {
            v.iter()
                .map(|p| p.parse::<Prefix>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(Error::Malformed)
        };
        let withdrawn = parse_prefixes(&self.withdrawn)?;
        let announced = parse_prefixes(&self.announced)?;

        let mut events: Vec<RouteEvent> = withdrawn
            .into_iter()
            .unique()
            .map(|p| RouteEvent::withdrawal(p, timestamp, source))
            .collect();
        events.extend(announced.into_iter().unique().map(|p| {
            RouteEvent::announcement(
                p,
                timestamp,
                as_path.clone(),
                next_hop,
                source,
            )
        }));
        Ok(Envelope::Update(events))
    }
}

/// Decode one envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, Error> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    // Depth in `path` at which the innermost AS set was opened.
    let mut as_set_depth: Option<usize> = None;
    let mut fields = Fields::default();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = local_name(&e);
                fields.mark(&name);
                if as_set_depth.is_none() && is_as_set(&e)? {
                    as_set_depth = Some(path.len());
                }
                path.push(name);
            }
            Event::Empty(e) => fields.mark(&local_name(&e)),
            Event::End(_) => {
                path.pop();
                if as_set_depth == Some(path.len()) {
                    as_set_depth = None;
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                fields.text(&path, as_set_depth.is_some(), text);
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t).trim().to_string();
                fields.text(&path, as_set_depth.is_some(), text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !path.is_empty() {
        return Err(Error::Malformed("truncated document".into()));
    }

    fields.into_envelope()
}

/// Envelope decoder that logs and discards what it cannot decode.
#[derive(Clone)]
pub struct EnvelopeParser {
    log: Logger,
}

impl EnvelopeParser {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }

    pub fn parse(&self, bytes: &[u8]) -> Option<Envelope> {
        match decode_envelope(bytes) {
            Ok(Envelope::Keepalive) => {
                feed_log!(self, trace, "keepalive");
                Some(Envelope::Keepalive)
            }
            Ok(envelope) => Some(envelope),
            Err(e) => {
                feed_log!(self, warn, "discarding envelope: {e}";
                    "envelope" => String::from_utf8_lossy(
                        &bytes[..bytes.len().min(512)]
                    ).into_owned()
                );
                None
            }
        }
    }
}
