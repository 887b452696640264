// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for oracle decoding and the pipeline codec.

use crate::oracle::decode_response;
use crate::pipeline::{PipelineItem, PipelineMessage};
use proptest::prelude::*;
use std::net::Ipv4Addr;
use vdb::{Asn, Prefix, ValidityState};

#[derive(Debug, Clone, Copy)]
struct Roa {
    asn: u32,
    min_len: u8,
    max_len: u8,
}

// Small AS and length pools so that matches and mismatches both occur.
fn roa_strategy() -> impl Strategy<Value = Roa> {
    (65000u32..65003, 8u8..=24, 0u8..=8).prop_map(|(asn, min_len, extra)| Roa {
        asn,
        min_len,
        max_len: min_len + extra,
    })
}

fn response_line(len: u8, asn: u32, roas: &[Roa], code: u16) -> String {
    let roas: Vec<String> = roas
        .iter()
        .map(|r| format!("{} 10.0.0.0 {} {}", r.asn, r.min_len, r.max_len))
        .collect();
    format!("10.0.0.0 {len} {asn}|{}|{code}", roas.join(","))
}

proptest! {
    /// Arbitrary oracle output never panics the decoder.
    #[test]
    fn prop_decode_total(line in ".{0,96}") {
        let v = decode_response(&line);
        if v.state.is_error() {
            prop_assert_eq!(v.vrps, None);
        }
    }

    /// Every ROA of a decoded response lands in exactly one bucket, and
    /// the state follows from which buckets are populated.
    #[test]
    fn prop_bucket_partition(
        len in 8u8..=32,
        asn in 65000u32..65003,
        roas in proptest::collection::vec(roa_strategy(), 1..6),
    ) {
        let v = decode_response(&response_line(len, asn, &roas, 2));
        let b = v.vrps.expect("buckets");
        prop_assert_eq!(
            b.matched.len() + b.unmatched_as.len() + b.unmatched_length.len(),
            roas.len()
        );
        for vrp in &b.matched {
            prop_assert_eq!(vrp.asn, Asn(asn));
            prop_assert!(len <= vrp.max_length);
        }
        for vrp in &b.unmatched_as {
            prop_assert_ne!(vrp.asn, Asn(asn));
        }
        for vrp in &b.unmatched_length {
            prop_assert_eq!(vrp.asn, Asn(asn));
            prop_assert!(len > vrp.max_length);
        }
        let expected = if !b.matched.is_empty() {
            ValidityState::Valid
        } else if b.unmatched_length.is_empty() {
            ValidityState::InvalidAs
        } else if b.unmatched_as.is_empty() {
            ValidityState::InvalidLength
        } else {
            ValidityState::Invalid
        };
        prop_assert_eq!(v.state, expected);
    }

    /// A decoded verdict survives the pipeline line format unchanged.
    #[test]
    fn prop_pipeline_preserves_verdict(
        len in 8u8..=32,
        asn in 65000u32..65003,
        roas in proptest::collection::vec(roa_strategy(), 0..4),
        code in 0u16..3,
        ts in any::<i64>(),
    ) {
        let verdict = decode_response(&response_line(len, asn, &roas, code));
        let msg = PipelineMessage::announcement(
            Prefix::new(Ipv4Addr::new(10, 0, 0, 0).into(), len),
            Asn(asn),
            ts,
            verdict,
            None,
            None,
        );
        let item = PipelineItem::Message(msg);
        let line = item.to_line().expect("encode");
        prop_assert!(!line.contains('\n'));
        prop_assert_eq!(PipelineItem::parse_line(&line).expect("decode"), item);
    }
}
