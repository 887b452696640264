// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for stream reassembly.

use crate::framer::{Deframer, DEFAULT_DELIMITER, DEFAULT_WRAPPER};
use proptest::prelude::*;

// Envelope bodies never contain '<' so they cannot contain the delimiter or
// the wrapper.
fn body_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 =\"/>\n]{0,64}"
}

fn deframer() -> Deframer {
    Deframer::new(
        DEFAULT_DELIMITER.as_bytes(),
        DEFAULT_WRAPPER.as_bytes(),
        1 << 20,
    )
}

fn stream(bodies: &[String], tail: &str) -> (Vec<u8>, Vec<Vec<u8>>) {
    let expected: Vec<Vec<u8>> = bodies
        .iter()
        .map(|b| format!("{b}{DEFAULT_DELIMITER}").into_bytes())
        .collect();
    let mut bytes = DEFAULT_WRAPPER.as_bytes().to_vec();
    for e in &expected {
        bytes.extend_from_slice(e);
    }
    bytes.extend_from_slice(tail.as_bytes());
    (bytes, expected)
}

proptest! {
    /// The same envelopes come out no matter where the stream is split.
    #[test]
    fn prop_fragmentation_invariance(
        bodies in proptest::collection::vec(body_strategy(), 0..8),
        tail in body_strategy(),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..16),
    ) {
        let (bytes, expected) = stream(&bodies, &tail);

        let mut points: Vec<usize> =
            cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
        points.push(0);
        points.push(bytes.len());
        points.sort_unstable();
        points.dedup();

        let mut d = deframer();
        let mut out = Vec::new();
        for w in points.windows(2) {
            out.extend(d.push(&bytes[w[0]..w[1]]));
        }
        prop_assert_eq!(&out, &expected);
        prop_assert_eq!(d.buffered(), tail.len());

        let mut whole = deframer();
        prop_assert_eq!(whole.push(&bytes), expected);
    }

    /// Byte at a time delivery is the extreme case of fragmentation.
    #[test]
    fn prop_byte_at_a_time(
        bodies in proptest::collection::vec(body_strategy(), 1..4),
    ) {
        let (bytes, expected) = stream(&bodies, "");
        let mut d = deframer();
        let mut out = Vec::new();
        for b in &bytes {
            out.extend(d.push(std::slice::from_ref(b)));
        }
        prop_assert_eq!(out, expected);
    }
}
