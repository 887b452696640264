// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route origin validation and the pipeline from validation to storage.

pub mod coordinator;
pub mod error;
pub mod oracle;
pub mod persist;
pub mod pipeline;
pub mod process;
pub mod validator;

mod log;

#[cfg(test)]
mod proptest;

pub use coordinator::{Backpressure, Coordinator, CoordinatorConfig};
pub use pipeline::{PipelineItem, PipelineMessage};
pub use process::{OracleConfig, ProcessState, SupervisedProcess};
pub use validator::{Validator, Work};

pub const COMPONENT_ROV: &str = "rov";
pub const MOD_VALIDATOR: &str = "validator";
pub const MOD_COORDINATOR: &str = "coordinator";
pub const MOD_PERSIST: &str = "persist";
