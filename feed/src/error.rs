// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error {0}")]
    Io(#[from] std::io::Error),

    #[error("xml error {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("xml attribute error {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("malformed feed line: {0}")]
    Line(String),
}
