// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route monitor feed ingestion: stream framing, envelope parsing and
//! snapshot/update synchronization.

pub mod envelope;
pub mod error;
pub mod event;
pub mod framer;
pub mod reader;
pub mod sync;

mod log;

#[cfg(test)]
mod proptest;

pub use envelope::{Envelope, EnvelopeParser};
pub use event::{FeedLine, RouteEvent, RouteEventKind};
pub use framer::{Deframer, FeedStream, FramerConfig, ReaderFrames};
pub use reader::{FeedReader, FeedRole};
pub use sync::{SyncGate, SyncState, TimeWindow};

pub const COMPONENT_FEED: &str = "feed";
pub const MOD_FRAMER: &str = "framer";
pub const MOD_PARSER: &str = "parser";
pub const MOD_SYNC: &str = "sync";
