// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory [`ValidityStore`] used for dry runs and tests.

use crate::error::Error;
use crate::log::vdb_log;
use crate::materialize::{
    expired_not_found, latest_per_prefix, stats_cutoff, superseded, tally,
};
use crate::store::{
    ArchiveMode, ArchivePolicy, ArchiveReport, CompactionReport,
    ValidityStore,
};
use crate::types::{Prefix, StatsSnapshot, ValidityRecord};
use rov_common::lock;
use slog::Logger;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const UNIT_BACKEND: &str = "memory";

/// Raw record key: prefix, timestamp, write sequence.
type RecordKey = (Prefix, i64, u64);

#[derive(Default)]
struct Inner {
    seq: u64,
    records: BTreeMap<RecordKey, ValidityRecord>,
    latest: BTreeMap<Prefix, ValidityRecord>,
    stats: BTreeMap<(i64, u64), StatsSnapshot>,
    archive: BTreeMap<RecordKey, ValidityRecord>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn prefix_range(
        map: &BTreeMap<RecordKey, ValidityRecord>,
        prefix: &Prefix,
    ) -> Vec<ValidityRecord> {
        map.range((*prefix, i64::MIN, 0)..=(*prefix, i64::MAX, u64::MAX))
            .rev()
            .map(|(_, r)| r.clone())
            .collect()
    }
}

pub struct MemStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
    log: Logger,
}

impl MemStore {
    pub fn new(log: Logger) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            closed: AtomicBool::new(false),
            log,
        }
    }

    /// Simulate loss of the backing connection. Every operation fails with
    /// [`Error::Closed`] until [`ValidityStore::reconnect`] is called.
    pub fn close(&self) {
        vdb_log!(self, warn, "store closed");
        self.closed.store(true, Ordering::Release);
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl ValidityStore for MemStore {
    fn backend(&self) -> &'static str {
        UNIT_BACKEND
    }

    fn ingest(&self, records: &[ValidityRecord]) -> Result<usize, Error> {
        self.check()?;
        let mut inner = lock!(self.inner);
        for r in records {
            let seq = inner.next_seq();
            inner.records.insert((r.prefix, r.timestamp, seq), r.clone());
        }
        Ok(records.len())
    }

    fn remove_prefix(&self, prefix: &Prefix) -> Result<usize, Error> {
        self.check()?;
        let mut inner = lock!(self.inner);
        let before = inner.records.len();
        inner.records.retain(|(p, _, _), _| p != prefix);
        Ok(before - inner.records.len())
    }

    fn compact(&self) -> Result<CompactionReport, Error> {
        self.check()?;
        let mut inner = lock!(self.inner);
        let latest = latest_per_prefix(inner.records.values().cloned());
        let removed = inner
            .latest
            .keys()
            .filter(|p| !latest.contains_key(p))
            .count();
        let prefixes = latest.len();
        inner.latest = latest;
        Ok(CompactionReport { prefixes, removed })
    }

    fn snapshot_stats(&self) -> Result<Option<StatsSnapshot>, Error> {
        self.check()?;
        let mut inner = lock!(self.inner);
        let Some(snap) = tally(inner.latest.values()) else {
            return Ok(None);
        };
        let seq = inner.next_seq();
        inner.stats.insert((snap.timestamp, seq), snap);
        Ok(Some(snap))
    }

    fn archive_or_purge(
        &self,
        policy: &ArchivePolicy,
    ) -> Result<ArchiveReport, Error> {
        self.check()?;
        let mut inner = lock!(self.inner);
        let records: Vec<(RecordKey, ValidityRecord)> = inner
            .records
            .iter()
            .map(|(k, r)| (*k, r.clone()))
            .collect();

        let stale = superseded(records.iter().cloned());
        let expired: Vec<RecordKey> = match policy.notfound_max_age {
            Some(age) => {
                let stale_set: HashSet<&RecordKey> = stale.iter().collect();
                expired_not_found(records, age)
                    .into_iter()
                    .filter(|k| !stale_set.contains(k))
                    .collect()
            }
            None => Vec::new(),
        };

        for key in &stale {
            if let Some(r) = inner.records.remove(key) {
                if policy.mode == ArchiveMode::Archive {
                    inner.archive.insert(*key, r);
                }
            }
        }
        for key in &expired {
            inner.records.remove(key);
        }

        let mut stats_pruned = 0;
        if let Some(age) = policy.stats_max_age {
            let newest = inner.stats.last_key_value().map(|(&(ts, _), _)| ts);
            if let Some(newest) = newest {
                let cutoff = stats_cutoff(newest, age);
                let before = inner.stats.len();
                inner.stats.retain(|(ts, _), _| *ts >= cutoff);
                stats_pruned = before - inner.stats.len();
            }
        }

        Ok(ArchiveReport {
            superseded: stale.len(),
            notfound_purged: expired.len(),
            stats_pruned,
        })
    }

    fn latest(&self, prefix: &Prefix) -> Result<Option<ValidityRecord>, Error> {
        self.check()?;
        Ok(lock!(self.inner).latest.get(prefix).cloned())
    }

    fn latest_all(&self) -> Result<Vec<ValidityRecord>, Error> {
        self.check()?;
        Ok(lock!(self.inner).latest.values().cloned().collect())
    }

    fn history(&self, prefix: &Prefix) -> Result<Vec<ValidityRecord>, Error> {
        self.check()?;
        Ok(Inner::prefix_range(&lock!(self.inner).records, prefix))
    }

    fn archived(&self, prefix: &Prefix) -> Result<Vec<ValidityRecord>, Error> {
        self.check()?;
        Ok(Inner::prefix_range(&lock!(self.inner).archive, prefix))
    }

    fn stats_since(&self, since: i64) -> Result<Vec<StatsSnapshot>, Error> {
        self.check()?;
        Ok(lock!(self.inner)
            .stats
            .range((since, 0)..)
            .map(|(_, s)| *s)
            .collect())
    }

    fn record_count(&self) -> Result<usize, Error> {
        self.check()?;
        Ok(lock!(self.inner).records.len())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reconnect(&self) -> Result<(), Error> {
        vdb_log!(self, info, "store reconnected");
        self.closed.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{Asn, ValidityState, Verdict, VrpBuckets};
    use pretty_assertions::assert_eq;
    use rov_common::log::discard_logger;
    use std::time::Duration;

    fn rec(prefix: &str, ts: i64, state: ValidityState) -> ValidityRecord {
        ValidityRecord::announcement(
            prefix.parse().expect("prefix"),
            Asn(64500),
            ts,
            Verdict {
                state,
                vrps: Some(VrpBuckets::default()),
            },
            None,
            None,
        )
    }

    fn timestamps(records: Vec<ValidityRecord>) -> Vec<i64> {
        records.iter().map(|r| r.timestamp).collect()
    }

    #[test]
    fn compaction_is_idempotent() {
        let s = MemStore::new(discard_logger());
        s.ingest(&[
            rec("10.0.0.0/8", 3, ValidityState::Valid),
            rec("10.0.0.0/8", 1, ValidityState::NotFound),
            rec("2001:db8::/32", 2, ValidityState::InvalidLength),
        ])
        .expect("ingest");
        let first = s.compact().expect("compact");
        let view = s.latest_all().expect("view");
        let second = s.compact().expect("compact");
        assert_eq!(first, second);
        assert_eq!(view, s.latest_all().expect("view"));
        assert_eq!(timestamps(view), vec![3, 2]);
    }

    #[test]
    fn archive_scenario() {
        let s = MemStore::new(discard_logger());
        let p: Prefix = "203.0.113.0/24".parse().expect("prefix");
        s.ingest(&[
            rec("203.0.113.0/24", 100, ValidityState::NotFound),
            rec("203.0.113.0/24", 200, ValidityState::Valid),
            rec("203.0.113.0/24", 300, ValidityState::InvalidAs),
        ])
        .expect("ingest");
        s.compact().expect("compact");
        let report =
            s.archive_or_purge(&ArchivePolicy::default()).expect("archive");
        assert_eq!(report.superseded, 2);
        assert_eq!(timestamps(s.history(&p).expect("history")), vec![300]);
        assert_eq!(
            timestamps(s.archived(&p).expect("archived")),
            vec![200, 100]
        );
        assert_eq!(
            s.latest(&p).expect("latest").and_then(|r| r.state()),
            Some(ValidityState::InvalidAs)
        );

        let again =
            s.archive_or_purge(&ArchivePolicy::default()).expect("archive");
        assert_eq!(again, ArchiveReport::default());
    }

    #[test]
    fn equal_timestamps_resolve_to_last_write() {
        let s = MemStore::new(discard_logger());
        let p: Prefix = "10.9.0.0/16".parse().expect("prefix");
        s.ingest(&[rec("10.9.0.0/16", 5, ValidityState::Valid)])
            .expect("ingest");
        s.ingest(&[rec("10.9.0.0/16", 5, ValidityState::InvalidAs)])
            .expect("ingest");
        s.compact().expect("compact");
        assert_eq!(
            s.latest(&p).expect("latest").and_then(|r| r.state()),
            Some(ValidityState::InvalidAs)
        );
    }

    #[test]
    fn notfound_purge_uses_newest_record_time() {
        let s = MemStore::new(discard_logger());
        s.ingest(&[
            rec("10.0.0.0/24", 0, ValidityState::NotFound),
            rec("10.0.1.0/24", 7200, ValidityState::NotFound),
            rec("10.0.2.0/24", 8000, ValidityState::Valid),
        ])
        .expect("ingest");
        let policy = ArchivePolicy {
            notfound_max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let report = s.archive_or_purge(&policy).expect("purge");
        assert_eq!(report.notfound_purged, 1);
        assert_eq!(s.record_count().expect("count"), 2);
    }

    #[test]
    fn withdrawn_latest_is_counted_separately() {
        let s = MemStore::new(discard_logger());
        let p: Prefix = "10.0.0.0/24".parse().expect("prefix");
        s.ingest(&[
            rec("10.0.0.0/24", 1, ValidityState::Valid),
            ValidityRecord::withdrawn(p, 2, None),
        ])
        .expect("ingest");
        s.compact().expect("compact");
        let snap = s.snapshot_stats().expect("stats").expect("snapshot");
        assert_eq!(snap.total.withdrawn, 1);
        assert_eq!(snap.total.total(), 0);
        assert_eq!(s.stats_since(0).expect("since").len(), 1);
        assert!(s.stats_since(3).expect("since").is_empty());
    }

    #[test]
    fn closed_store_rejects_operations() {
        let s = MemStore::new(discard_logger());
        s.close();
        assert!(s.is_closed());
        assert!(matches!(s.record_count(), Err(Error::Closed)));
        s.reconnect().expect("reconnect");
        assert_eq!(s.record_count().expect("count"), 0);
    }

    #[test]
    fn empty_view_has_no_snapshot() {
        let s = MemStore::new(discard_logger());
        assert_eq!(s.snapshot_stats().expect("stats"), None);
    }
}
