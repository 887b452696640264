// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for prefix keys and store materialization.

use crate::mem::MemStore;
use crate::store::{ArchivePolicy, ValidityStore};
use crate::types::{
    Asn, Prefix, Prefix4, Prefix6, ValidityRecord, ValidityState, Verdict,
    VrpBuckets,
};
use proptest::prelude::*;
use rov_common::log::discard_logger;
use std::net::{Ipv4Addr, Ipv6Addr};

fn ipv4_prefix_strategy() -> impl Strategy<Value = Prefix4> {
    (any::<u32>(), 0u8..=32u8).prop_map(|(addr_bits, length)| {
        Prefix4::new(Ipv4Addr::from(addr_bits), length)
    })
}

fn ipv6_prefix_strategy() -> impl Strategy<Value = Prefix6> {
    (any::<u128>(), 0u8..=128u8).prop_map(|(addr_bits, length)| {
        Prefix6::new(Ipv6Addr::from(addr_bits), length)
    })
}

fn prefix_strategy() -> impl Strategy<Value = Prefix> {
    prop_oneof![
        ipv4_prefix_strategy().prop_map(Prefix::from),
        ipv6_prefix_strategy().prop_map(Prefix::from),
    ]
}

fn state_strategy() -> impl Strategy<Value = Option<ValidityState>> {
    prop_oneof![
        Just(None),
        Just(Some(ValidityState::Valid)),
        Just(Some(ValidityState::NotFound)),
        Just(Some(ValidityState::InvalidAs)),
        Just(Some(ValidityState::InvalidLength)),
        Just(Some(ValidityState::ErrorTimeout)),
    ]
}

// A small pool of prefixes so that records collide often.
fn record_strategy() -> impl Strategy<Value = ValidityRecord> {
    (0u8..4, 0i64..50, state_strategy()).prop_map(|(net, ts, state)| {
        let prefix: Prefix =
            Prefix4::new(Ipv4Addr::new(10, net, 0, 0), 16).into();
        match state {
            None => ValidityRecord::withdrawn(prefix, ts, None),
            Some(state) => ValidityRecord::announcement(
                prefix,
                Asn(64512),
                ts,
                if state.is_error() {
                    Verdict::error(state)
                } else {
                    Verdict {
                        state,
                        vrps: Some(VrpBuckets::default()),
                    }
                },
                None,
                None,
            ),
        }
    })
}

proptest! {
    #[test]
    fn prop_ipv4_host_bits_always_unset(prefix in ipv4_prefix_strategy()) {
        prop_assert!(
            prefix.host_bits_are_unset(),
            "IPv4 prefix {prefix} should have host bits unset"
        );
    }

    #[test]
    fn prop_ipv6_host_bits_always_unset(prefix in ipv6_prefix_strategy()) {
        prop_assert!(
            prefix.host_bits_are_unset(),
            "IPv6 prefix {prefix} should have host bits unset"
        );
    }

    /// Parsing the display form yields the same prefix.
    #[test]
    fn prop_prefix_display_parses_back(prefix in prefix_strategy()) {
        let parsed: Prefix = prefix.to_string().parse().map_err(|e: String| {
            TestCaseError::fail(e)
        })?;
        prop_assert_eq!(parsed, prefix);
    }

    /// Database keys decode back to their prefix.
    #[test]
    fn prop_db_key_decodes(prefix in prefix_strategy()) {
        let decoded = Prefix::from_db_key(&prefix.db_key())
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(decoded, prefix);
    }

    /// A prefix is always within itself and within its supernets.
    #[test]
    fn prop_within_supernet(prefix in ipv4_prefix_strategy(), shorter in 0u8..=32) {
        let len = shorter.min(prefix.length);
        let supernet = Prefix4::new(prefix.value, len);
        prop_assert!(prefix.within(&prefix));
        prop_assert!(prefix.within(&supernet));
    }

    /// Compaction yields one entry per prefix holding its newest record, and
    /// running it again changes nothing.
    #[test]
    fn prop_compaction_idempotent(
        records in proptest::collection::vec(record_strategy(), 0..40)
    ) {
        let store = MemStore::new(discard_logger());
        store.ingest(&records).map_err(|e| TestCaseError::fail(e.to_string()))?;
        store.compact().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let first = store.latest_all().map_err(|e| TestCaseError::fail(e.to_string()))?;
        store.compact().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let second = store.latest_all().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(&first, &second);

        for entry in &first {
            let newest = records
                .iter()
                .filter(|r| r.prefix == entry.prefix)
                .map(|r| r.timestamp)
                .max();
            prop_assert_eq!(Some(entry.timestamp), newest);
        }
    }

    /// Archival leaves exactly one live record per prefix and does not
    /// change the latest view.
    #[test]
    fn prop_archive_keeps_latest(
        records in proptest::collection::vec(record_strategy(), 1..40)
    ) {
        let store = MemStore::new(discard_logger());
        store.ingest(&records).map_err(|e| TestCaseError::fail(e.to_string()))?;
        store.compact().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let before = store.latest_all().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let report = store
            .archive_or_purge(&ArchivePolicy::default())
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let live = store.record_count().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(live, before.len());
        prop_assert_eq!(report.superseded + live, records.len());
        store.compact().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let after = store.latest_all().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(before, after);
    }
}
