// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend independent materialization logic.
//!
//! Backends hand these functions their raw records in key order, that is
//! grouped by prefix and ascending by (timestamp, write sequence). Every
//! function here is pure so that compaction, statistics and archival behave
//! identically on every backend.

use crate::types::{Prefix, StatsSnapshot, ValidityRecord, ValidityState};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::time::Duration;

/// Reduce records to the one with the greatest timestamp per prefix. Records
/// must be supplied in write order within a prefix so that equal timestamps
/// resolve to the last written record.
pub fn latest_per_prefix<I>(records: I) -> BTreeMap<Prefix, ValidityRecord>
where
    I: IntoIterator<Item = ValidityRecord>,
{
    let mut latest: BTreeMap<Prefix, ValidityRecord> = BTreeMap::new();
    for r in records {
        match latest.get(&r.prefix) {
            Some(current) if current.timestamp > r.timestamp => {}
            _ => {
                latest.insert(r.prefix, r);
            }
        }
    }
    latest
}

/// Keys of every record that is not the latest record for its prefix.
pub fn superseded<K, I>(records: I) -> Vec<K>
where
    I: IntoIterator<Item = (K, ValidityRecord)>,
{
    records
        .into_iter()
        .into_group_map_by(|(_, r)| r.prefix)
        .into_values()
        .flat_map(|group| {
            // max_by_key yields the last of several equal maxima, which is
            // the last written record.
            let winner = group
                .iter()
                .enumerate()
                .max_by_key(|(_, (_, r))| r.timestamp)
                .map(|(i, _)| i);
            group
                .into_iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != winner)
                .map(|(_, (k, _))| k)
        })
        .collect()
}

/// Keys of the records of every prefix whose current state is `NotFound` and
/// whose latest observation is older than `max_age` measured back from the
/// newest timestamp in the record set.
pub fn expired_not_found<K, I>(records: I, max_age: Duration) -> Vec<K>
where
    I: IntoIterator<Item = (K, ValidityRecord)>,
{
    let groups = records.into_iter().into_group_map_by(|(_, r)| r.prefix);
    let Some(newest) = groups
        .values()
        .flat_map(|g| g.iter().map(|(_, r)| r.timestamp))
        .max()
    else {
        return Vec::new();
    };
    let cutoff = newest.saturating_sub(max_age_secs(max_age));

    groups
        .into_values()
        .filter(|group| {
            group
                .iter()
                .map(|(_, r)| r)
                .max_by_key(|r| r.timestamp)
                .is_some_and(|r| {
                    r.state() == Some(ValidityState::NotFound)
                        && r.timestamp < cutoff
                })
        })
        .flat_map(|group| group.into_iter().map(|(k, _)| k))
        .collect()
}

/// Count latest-view entries per state. Returns `None` for an empty view.
pub fn tally<'a, I>(latest: I) -> Option<StatsSnapshot>
where
    I: IntoIterator<Item = &'a ValidityRecord>,
{
    let mut snap = StatsSnapshot::default();
    let mut newest = None;
    for r in latest {
        newest = newest.max(Some(r.timestamp));
        let state = r.state();
        snap.total.add(state);
        let family = if r.prefix.is_ipv4() {
            &mut snap.ipv4
        } else {
            &mut snap.ipv6
        };
        family.prefixes.add(state);
        if let Some(state) = state {
            family.addresses.add(state, r.prefix.size());
        }
    }
    snap.timestamp = newest?;
    Some(snap)
}

/// Timestamp before which snapshots are pruned, given the newest snapshot.
pub fn stats_cutoff(newest: i64, max_age: Duration) -> i64 {
    newest.saturating_sub(max_age_secs(max_age))
}

fn max_age_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
