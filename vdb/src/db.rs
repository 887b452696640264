// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent validity database.
//!
//! Records are kept in a sled key-value store that is persisted to disk via
//! flush operations. Raw records are keyed by prefix, then timestamp, then a
//! write sequence number, so a prefix scan returns the history of one prefix
//! in write order and equal timestamps resolve to the last write.
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
use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, IVec, Transactional};
use slog::Logger;
use std::collections::HashSet;

const UNIT_BACKEND: &str = "sled";

/// The handle used to open the tree of raw validity records.
const VALIDITY: &str = "validity";

/// The handle used to open the tree holding the latest record per prefix.
const VALIDITY_LATEST: &str = "validity_latest";

/// The handle used to open the statistics time series tree.
const VALIDITY_STATS: &str = "validity_stats";

/// The handle used to open the tree of archived, superseded records.
const VALIDITY_ARCHIVE: &str = "validity_archive";

/// Encode a timestamp so that byte order matches numeric order.
fn ts_key(ts: i64) -> [u8; 8] {
    ((ts as u64) ^ (1 << 63)).to_be_bytes()
}

fn ts_from_key(v: &[u8]) -> Result<i64, Error> {
    let bytes: [u8; 8] = v
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::DbKey(format!(
            "buffer too short for timestamp {} < 8",
            v.len()
        )))?;
    Ok((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64)
}

fn record_key(prefix: &Prefix, ts: i64, seq: u64) -> Vec<u8> {
    let mut key = prefix.db_key();
    key.extend_from_slice(&ts_key(ts));
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn stats_key(ts: i64, seq: u64) -> Vec<u8> {
    let mut key = ts_key(ts).to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// sled backed [`ValidityStore`].
#[derive(Clone)]
pub struct Db {
    /// A sled database handle where all validity information is stored.
    persistent: sled::Db,

    log: Logger,
}

impl Db {
    /// Open (or create) a validity database that stores persistent data at
    /// `path`.
    pub fn new(path: &str, log: Logger) -> Result<Self, Error> {
        Ok(Self {
            persistent: sled::open(path)?,
            log,
        })
    }

    fn tree(&self, name: &str) -> Result<sled::Tree, Error> {
        Ok(self.persistent.open_tree(name)?)
    }

    fn decode<T: DeserializeOwned>(&self, value: &[u8]) -> Result<T, Error> {
        Ok(serde_json::from_slice(value)?)
    }

    /// All decodable records under `key_prefix` in key order. Entries that
    /// fail to load are logged and skipped.
    fn scan_records(
        &self,
        tree: &sled::Tree,
        key_prefix: Vec<u8>,
    ) -> Vec<(IVec, ValidityRecord)> {
        tree.scan_prefix(key_prefix)
            .filter_map(|item| {
                let (key, value) = match item {
                    Ok(item) => item,
                    Err(e) => {
                        vdb_log!(self, error,
                            "error fetching validity entry: {e}";
                            "tree" => String::from_utf8_lossy(&tree.name()).to_string()
                        );
                        return None;
                    }
                };
                match self.decode(&value) {
                    Ok(r) => Some((key, r)),
                    Err(e) => {
                        vdb_log!(self, error,
                            "error parsing validity entry value: {e}";
                            "tree" => String::from_utf8_lossy(&tree.name()).to_string()
                        );
                        None
                    }
                }
            })
            .collect()
    }

    fn remove_keys(tree: &sled::Tree, keys: &[IVec]) -> Result<(), Error> {
        let mut batch = Batch::default();
        for k in keys {
            batch.remove(k.clone());
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    fn prune_stats(
        &self,
        max_age: std::time::Duration,
    ) -> Result<usize, Error> {
        let stats = self.tree(VALIDITY_STATS)?;
        let newest = match stats.last()? {
            Some((key, _)) => ts_from_key(&key)?,
            None => return Ok(0),
        };
        let cutoff = stats_cutoff(newest, max_age);
        let keys: Vec<IVec> = stats
            .range(..ts_key(cutoff).to_vec())
            .keys()
            .collect::<Result<_, _>>()?;
        Self::remove_keys(&stats, &keys)?;
        stats.flush()?;
        Ok(keys.len())
    }
}

impl ValidityStore for Db {
    fn backend(&self) -> &'static str {
        UNIT_BACKEND
    }

    fn ingest(&self, records: &[ValidityRecord]) -> Result<usize, Error> {
        let tree = self.tree(VALIDITY)?;
        let mut batch = Batch::default();
        for r in records {
            let seq = self.persistent.generate_id()?;
            batch.insert(
                record_key(&r.prefix, r.timestamp, seq),
                serde_json::to_vec(r)?,
            );
        }
        tree.apply_batch(batch)?;
        tree.flush()?;
        Ok(records.len())
    }

    fn remove_prefix(&self, prefix: &Prefix) -> Result<usize, Error> {
        let tree = self.tree(VALIDITY)?;
        let keys: Vec<IVec> = tree
            .scan_prefix(prefix.db_key())
            .keys()
            .collect::<Result<_, _>>()?;
        Self::remove_keys(&tree, &keys)?;
        tree.flush()?;
        Ok(keys.len())
    }

    fn compact(&self) -> Result<CompactionReport, Error> {
        let raw = self.tree(VALIDITY)?;
        let view = self.tree(VALIDITY_LATEST)?;

        let latest = latest_per_prefix(
            self.scan_records(&raw, Vec::new())
                .into_iter()
                .map(|(_, r)| r),
        );

        // One batch so readers see either the old view or the new one.
        let mut batch = Batch::default();
        let mut removed = 0;
        for key in view.iter().keys() {
            let key = key?;
            let keep = Prefix::from_db_key(&key)
                .map(|p| latest.contains_key(&p))
                .unwrap_or(false);
            if !keep {
                batch.remove(key);
                removed += 1;
            }
        }
        for (prefix, record) in &latest {
            batch.insert(prefix.db_key(), serde_json::to_vec(record)?);
        }
        view.apply_batch(batch)?;
        view.flush()?;

        Ok(CompactionReport {
            prefixes: latest.len(),
            removed,
        })
    }

    fn snapshot_stats(&self) -> Result<Option<StatsSnapshot>, Error> {
        let latest = self.latest_all()?;
        let Some(snap) = tally(latest.iter()) else {
            return Ok(None);
        };
        let stats = self.tree(VALIDITY_STATS)?;
        let seq = self.persistent.generate_id()?;
        stats.insert(stats_key(snap.timestamp, seq), serde_json::to_vec(&snap)?)?;
        stats.flush()?;
        Ok(Some(snap))
    }

    fn archive_or_purge(
        &self,
        policy: &ArchivePolicy,
    ) -> Result<ArchiveReport, Error> {
        let raw = self.tree(VALIDITY)?;
        let records = self.scan_records(&raw, Vec::new());

        let stale: Vec<IVec> = superseded(records.iter().cloned());
        let expired: Vec<IVec> = match policy.notfound_max_age {
            Some(age) => {
                let stale_set: HashSet<&IVec> = stale.iter().collect();
                expired_not_found(records.into_iter(), age)
                    .into_iter()
                    .filter(|k| !stale_set.contains(k))
                    .collect()
            }
            None => Vec::new(),
        };

        match policy.mode {
            ArchiveMode::Archive => {
                let archive = self.tree(VALIDITY_ARCHIVE)?;
                (&raw, &archive)
                    .transaction(|(raw, archive)| {
                        for key in &stale {
                            if let Some(value) = raw.remove(key.clone())? {
                                archive.insert(key.clone(), value)?;
                            }
                        }
                        for key in &expired {
                            raw.remove(key.clone())?;
                        }
                        Ok::<(), ConflictableTransactionError<()>>(())
                    })
                    .map_err(|e: TransactionError<()>| match e {
                        TransactionError::Abort(()) => Error::Transaction(
                            "archive transaction aborted".into(),
                        ),
                        TransactionError::Storage(e) => Error::DataStore(e),
                    })?;
                archive.flush()?;
            }
            ArchiveMode::Delete => {
                Self::remove_keys(&raw, &stale)?;
                Self::remove_keys(&raw, &expired)?;
            }
        }
        raw.flush()?;

        let stats_pruned = match policy.stats_max_age {
            Some(age) => self.prune_stats(age)?,
            None => 0,
        };

        Ok(ArchiveReport {
            superseded: stale.len(),
            notfound_purged: expired.len(),
            stats_pruned,
        })
    }

    fn latest(&self, prefix: &Prefix) -> Result<Option<ValidityRecord>, Error> {
        let view = self.tree(VALIDITY_LATEST)?;
        match view.get(prefix.db_key())? {
            Some(value) => Ok(Some(self.decode(&value)?)),
            None => Ok(None),
        }
    }

    fn latest_all(&self) -> Result<Vec<ValidityRecord>, Error> {
        let view = self.tree(VALIDITY_LATEST)?;
        Ok(self
            .scan_records(&view, Vec::new())
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    fn history(&self, prefix: &Prefix) -> Result<Vec<ValidityRecord>, Error> {
        let raw = self.tree(VALIDITY)?;
        Ok(self
            .scan_records(&raw, prefix.db_key())
            .into_iter()
            .rev()
            .map(|(_, r)| r)
            .collect())
    }

    fn archived(&self, prefix: &Prefix) -> Result<Vec<ValidityRecord>, Error> {
        let archive = self.tree(VALIDITY_ARCHIVE)?;
        Ok(self
            .scan_records(&archive, prefix.db_key())
            .into_iter()
            .rev()
            .map(|(_, r)| r)
            .collect())
    }

    fn stats_since(&self, since: i64) -> Result<Vec<StatsSnapshot>, Error> {
        let stats = self.tree(VALIDITY_STATS)?;
        let mut result = Vec::new();
        for item in stats.range(ts_key(since).to_vec()..) {
            let (_, value) = item?;
            match self.decode(&value) {
                Ok(snap) => result.push(snap),
                Err(e) => {
                    vdb_log!(self, error, "error parsing stats entry: {e}");
                }
            }
        }
        Ok(result)
    }

    fn record_count(&self) -> Result<usize, Error> {
        Ok(self.tree(VALIDITY)?.len())
    }
}
