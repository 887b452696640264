// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The validity database (vdb).
//!
//! Holds raw route validation records, the compacted latest-per-prefix view,
//! the statistics time series and the archive of superseded records. Every
//! backend implements [`ValidityStore`]; the daemon picks one at startup.

pub mod db;
pub mod error;
pub mod materialize;
pub mod mem;
pub mod store;
pub mod types;

pub use db::Db;
pub use mem::MemStore;
pub use store::*;
pub use types::*;

mod log;

#[cfg(test)]
mod proptest;


pub const COMPONENT_VDB: &str = "vdb";
pub const MOD_STORE: &str = "store";
