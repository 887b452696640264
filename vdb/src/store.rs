// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::types::{Prefix, StatsSnapshot, ValidityRecord};
use std::time::Duration;

/// What happens to records superseded by a newer record of the same prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveMode {
    /// Move superseded records to the archive.
    #[default]
    Archive,
    /// Delete superseded records outright.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchivePolicy {
    pub mode: ArchiveMode,

    /// Purge prefixes whose current state has been `NotFound` for longer
    /// than this, even without a successor record.
    pub notfound_max_age: Option<Duration>,

    /// Prune statistics snapshots older than this.
    pub stats_max_age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionReport {
    /// Entries in the latest view after compaction.
    pub prefixes: usize,
    /// Entries dropped from the latest view because their prefix has no
    /// records left.
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveReport {
    pub superseded: usize,
    pub notfound_purged: usize,
    pub stats_pruned: usize,
}

/// A validity store. Every method is atomic with respect to the others, so
/// ingest, compaction and archival workers may share one store without
/// coordinating among themselves.
pub trait ValidityStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Append raw records. Returns the number written.
    fn ingest(&self, records: &[ValidityRecord]) -> Result<usize, Error>;

    /// Delete every raw record of `prefix`. Returns the number deleted.
    fn remove_prefix(&self, prefix: &Prefix) -> Result<usize, Error>;

    /// Rebuild the latest view from the raw records, replacing it wholesale.
    fn compact(&self) -> Result<CompactionReport, Error>;

    /// Count the latest view per state and append the snapshot to the
    /// statistics series. Returns `None` without writing when the view is
    /// empty.
    fn snapshot_stats(&self) -> Result<Option<StatsSnapshot>, Error>;

    /// Archive or delete superseded records, purge expired `NotFound`
    /// prefixes and prune old statistics according to `policy`.
    fn archive_or_purge(
        &self,
        policy: &ArchivePolicy,
    ) -> Result<ArchiveReport, Error>;

    /// The latest view entry for `prefix`.
    fn latest(&self, prefix: &Prefix) -> Result<Option<ValidityRecord>, Error>;

    /// The whole latest view, ordered by prefix.
    fn latest_all(&self) -> Result<Vec<ValidityRecord>, Error>;

    /// Live raw records of `prefix`, newest first.
    fn history(&self, prefix: &Prefix) -> Result<Vec<ValidityRecord>, Error>;

    /// Archived records of `prefix`, newest first.
    fn archived(&self, prefix: &Prefix) -> Result<Vec<ValidityRecord>, Error>;

    /// Statistics snapshots with a timestamp at or after `since`, oldest
    /// first.
    fn stats_since(&self, since: i64) -> Result<Vec<StatsSnapshot>, Error>;

    /// Number of live raw records.
    fn record_count(&self) -> Result<usize, Error>;

    /// Whether the connection to the underlying store has been lost.
    fn is_closed(&self) -> bool {
        false
    }

    /// Re-establish a lost connection.
    fn reconnect(&self) -> Result<(), Error> {
        Ok(())
    }
}
