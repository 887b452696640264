// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line protocol of the external validation oracle.
//!
//! A request is `"<network> <mask-length> <asn>\n"`. The oracle answers with
//! one line, either `"<query>|<roa>,<roa>,...|<code>"` where each ROA match
//! is `"<asn> <network> <min-len> <max-len>"`, or one of the sentinels
//! `error`, `timeout` and `input error`.

use nom::{
    bytes::complete::take_while1,
    character::complete::{
        char, space0, space1, u16 as parse_u16, u32 as parse_u32,
        u8 as parse_u8,
    },
    combinator::{eof, map_res, opt},
    multi::separated_list0,
    sequence::preceded,
    IResult,
};
use std::net::IpAddr;
use vdb::{Asn, Prefix, ValidityState, Verdict, Vrp, VrpBuckets};

pub const SENTINEL_ERROR: &str = "error";
pub const SENTINEL_TIMEOUT: &str = "timeout";
pub const SENTINEL_INPUT_ERROR: &str = "input error";

pub fn encode_request(prefix: &Prefix, asn: Asn) -> String {
    format!("{} {} {}\n", prefix.addr(), prefix.length(), asn.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Query {
    length: u8,
    asn: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoaMatch {
    asn: u32,
    network: IpAddr,
    min_len: u8,
    max_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Response {
    query: Query,
    roas: Vec<RoaMatch>,
    code: u16,
}

fn ip_addr(input: &str) -> IResult<&str, IpAddr> {
    map_res(
        take_while1(|c: char| c.is_ascii_hexdigit() || c == '.' || c == ':'),
        |s: &str| s.parse::<IpAddr>(),
    )(input)
}

fn query(input: &str) -> IResult<&str, Query> {
    let (input, _) = space0(input)?;
    let (input, _network) = ip_addr(input)?;
    let (input, length) = preceded(space1, parse_u8)(input)?;
    let (input, asn) = preceded(space1, parse_u32)(input)?;
    let (input, _) = space0(input)?;
    Ok((input, Query { length, asn }))
}

fn roa_match(input: &str) -> IResult<&str, RoaMatch> {
    let (input, _) = space0(input)?;
    let (input, asn) = parse_u32(input)?;
    let (input, network) = preceded(space1, ip_addr)(input)?;
    // Some oracles write the ROA prefix in CIDR form.
    let (input, _) = opt(preceded(char('/'), parse_u8))(input)?;
    let (input, min_len) = preceded(space1, parse_u8)(input)?;
    let (input, max_len) = preceded(space1, parse_u8)(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        RoaMatch {
            asn,
            network,
            min_len,
            max_len,
        },
    ))
}

fn response(input: &str) -> IResult<&str, Response> {
    let (input, query) = query(input)?;
    let (input, _) = char('|')(input)?;
    let (input, roas) = separated_list0(char(','), roa_match)(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = char('|')(input)?;
    let (input, _) = space0(input)?;
    let (input, code) = parse_u16(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = eof(input)?;
    Ok((input, Response { query, roas, code }))
}

/// Classify ROA matches against the query. A ROA whose AS differs is
/// filed under `unmatched_as` even if its length also fails.
fn classify(r: Response) -> Verdict {
    let oracle_state = match ValidityState::try_from(r.code) {
        Ok(s) if !s.is_error() => s,
        _ => return Verdict::error(ValidityState::ErrorOutput),
    };
    if oracle_state == ValidityState::NotFound || r.roas.is_empty() {
        return Verdict::not_found();
    }

    let mut buckets = VrpBuckets::default();
    for roa in r.roas {
        let vrp = Vrp {
            asn: Asn(roa.asn),
            prefix: Prefix::new(roa.network, roa.min_len),
            max_length: roa.max_len,
        };
        if roa.asn != r.query.asn {
            buckets.unmatched_as.push(vrp);
        } else if r.query.length > roa.max_len {
            buckets.unmatched_length.push(vrp);
        } else {
            buckets.matched.push(vrp);
        }
    }

    let state = if !buckets.matched.is_empty() {
        ValidityState::Valid
    } else if buckets.unmatched_length.is_empty() {
        ValidityState::InvalidAs
    } else if buckets.unmatched_as.is_empty() {
        ValidityState::InvalidLength
    } else {
        ValidityState::Invalid
    };
    Verdict {
        state,
        vrps: Some(buckets),
    }
}

/// Decode one oracle response line. Never fails: anything that cannot be
/// understood becomes an error verdict.
pub fn decode_response(line: &str) -> Verdict {
    let line = line.trim();
    match line {
        SENTINEL_ERROR => Verdict::error(ValidityState::ErrorConnection),
        SENTINEL_TIMEOUT => Verdict::error(ValidityState::ErrorTimeout),
        SENTINEL_INPUT_ERROR => Verdict::error(ValidityState::ErrorInput),
        _ => match response(line) {
            Ok((_, r)) => classify(r),
            Err(_) => Verdict::error(ValidityState::ErrorOutput),
        },
    }
}
