// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error {0}")]
    Store(#[from] vdb::error::Error),

    #[error("oracle process exited: {0}")]
    ProcessExited(String),

    #[error("oracle did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed pipeline line: {0}")]
    Line(String),
}
