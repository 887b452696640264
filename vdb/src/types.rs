// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    pub const HOST_MASK: u8 = 32;

    /// Create a new `Prefix4` from an IP address and net mask.
    /// The newly created `Prefix4` will have its host bits zeroed upon creation
    /// e.g.
    /// ```
    /// use vdb::types::Prefix4;
    /// use std::net::Ipv4Addr;
    /// use std::str::FromStr;
    /// let p4 = Prefix4::new(Ipv4Addr::from_str("10.0.0.10").unwrap(), 24);
    /// assert_eq!(p4.value, Ipv4Addr::from_str("10.0.0.0").unwrap());
    /// ```
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn mask(&self) -> u32 {
        match self.length {
            0 => 0,
            l => (!0u32) << (Self::HOST_MASK - l.min(Self::HOST_MASK)),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & self.mask() == self.value.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.value = Ipv4Addr::from_bits(self.value.to_bits() & self.mask())
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the other.
    pub fn within(&self, other: &Prefix4) -> bool {
        if self.length < other.length {
            return false;
        }
        self.value.to_bits() & other.mask() == other.value.to_bits()
    }

    /// Number of addresses covered by this prefix.
    pub fn size(&self) -> u128 {
        1u128 << (Self::HOST_MASK - self.length.min(Self::HOST_MASK))
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv4Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} out of range"));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl PartialOrd for Prefix6 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix6 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl Prefix6 {
    pub const HOST_MASK: u8 = 128;

    /// Create a new `Prefix6` from an IP address and net mask.
    /// The newly created `Prefix6` will have its host bits zeroed upon creation
    /// e.g.
    /// ```
    /// use vdb::types::Prefix6;
    /// use std::net::Ipv6Addr;
    /// use std::str::FromStr;
    /// let p6 = Prefix6::new(Ipv6Addr::from_str("2001:db8::1").unwrap(), 64);
    /// assert_eq!(p6.value, Ipv6Addr::from_str("2001:db8::").unwrap());
    /// ```
    pub fn new(ip: Ipv6Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn mask(&self) -> u128 {
        match self.length {
            0 => 0,
            l => (!0u128) << (Self::HOST_MASK - l.min(Self::HOST_MASK)),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & self.mask() == self.value.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.value = Ipv6Addr::from_bits(self.value.to_bits() & self.mask())
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the other.
    pub fn within(&self, other: &Prefix6) -> bool {
        if self.length < other.length {
            return false;
        }
        self.value.to_bits() & other.mask() == other.value.to_bits()
    }

    /// Number of addresses covered by this prefix. A /0 saturates at
    /// `u128::MAX`.
    pub fn size(&self) -> u128 {
        match self.length {
            0 => u128::MAX,
            l => 1u128 << (Self::HOST_MASK - l.min(Self::HOST_MASK)),
        }
    }
}

impl FromStr for Prefix6 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv6Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} out of range"));
        }
        Ok(Self::new(value, length))
    }
}

/// A routed destination. Serialized in CIDR notation, e.g. `"10.0.0.0/24"`.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    PartialOrd,
    Ord,
)]
#[serde(try_from = "String", into = "String")]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::V4(p) => p.fmt(f),
            Prefix::V6(p) => p.fmt(f),
        }
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

impl From<Prefix> for String {
    fn from(value: Prefix) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Prefix {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(prefix4) = s.parse::<Prefix4>() {
            Ok(Self::V4(prefix4))
        } else if let Ok(prefix6) = s.parse::<Prefix6>() {
            Ok(Self::V6(prefix6))
        } else {
            Err(format!("malformed prefix '{s}'"))
        }
    }
}

impl Prefix {
    pub fn new(ip: IpAddr, length: u8) -> Self {
        match ip {
            IpAddr::V4(ip4) => Self::V4(Prefix4::new(ip4, length)),
            IpAddr::V6(ip6) => Self::V6(Prefix6::new(ip6, length)),
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            Self::V4(p4) => p4.value.into(),
            Self::V6(p6) => p6.value.into(),
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p4) => p4.length,
            Self::V6(p6) => p6.length,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    pub fn size(&self) -> u128 {
        match self {
            Self::V4(p4) => p4.size(),
            Self::V6(p6) => p6.size(),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        match self {
            Self::V4(p4) => p4.host_bits_are_unset(),
            Self::V6(p6) => p6.host_bits_are_unset(),
        }
    }

    pub fn within(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Self::V4(a), Self::V4(b)) => a.within(b),
            (Self::V6(a), Self::V6(b)) => a.within(b),
            _ => false,
        }
    }

    /// Database key for this prefix: an address family tag, the address
    /// octets and the length. Keys of one family all have the same width, so
    /// no key is a byte prefix of another and a prefix scan over a key
    /// selects exactly the records of that prefix.
    pub fn db_key(&self) -> Vec<u8> {
        match self {
            Self::V4(p4) => {
                let mut buf = vec![FAMILY_V4];
                buf.extend_from_slice(&p4.value.octets());
                buf.push(p4.length);
                buf
            }
            Self::V6(p6) => {
                let mut buf = vec![FAMILY_V6];
                buf.extend_from_slice(&p6.value.octets());
                buf.push(p6.length);
                buf
            }
        }
    }

    /// Number of key bytes [`Prefix::db_key`] produces for the family tagged
    /// by `family`.
    pub fn db_key_len(family: u8) -> Option<usize> {
        match family {
            FAMILY_V4 => Some(1 + 4 + 1),
            FAMILY_V6 => Some(1 + 16 + 1),
            _ => None,
        }
    }

    pub fn from_db_key(v: &[u8]) -> Result<Self, Error> {
        let family = *v
            .first()
            .ok_or(Error::DbKey("empty prefix key".to_string()))?;
        let want = Self::db_key_len(family).ok_or(Error::DbKey(format!(
            "unknown address family tag {family}"
        )))?;
        if v.len() < want {
            return Err(Error::DbKey(format!(
                "buffer too short for prefix key {} < {want}",
                v.len()
            )));
        }
        match family {
            FAMILY_V4 => {
                let octets: [u8; 4] = v[1..5].try_into().map_err(|_| {
                    Error::DbKey("failed to convert to IPv4 octets".into())
                })?;
                Ok(Prefix4::new(Ipv4Addr::from(octets), v[5]).into())
            }
            _ => {
                let octets: [u8; 16] = v[1..17].try_into().map_err(|_| {
                    Error::DbKey("failed to convert to IPv6 octets".into())
                })?;
                Ok(Prefix6::new(Ipv6Addr::from(octets), v[17]).into())
            }
        }
    }
}

/// An autonomous system number. Displayed and serialized as `AS<n>`; parses
/// from either `AS<n>` or a bare `<n>`.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    PartialOrd,
    Ord,
)]
#[serde(try_from = "String", into = "String")]
pub struct Asn(pub u32);

impl Display for Asn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AS{}", self.0)
    }
}

impl FromStr for Asn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("AS")
            .or_else(|| s.strip_prefix("as"))
            .unwrap_or(s);
        digits
            .parse()
            .map(Asn)
            .map_err(|_| format!("malformed asn '{s}'"))
    }
}

impl From<Asn> for String {
    fn from(value: Asn) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Asn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<u32> for Asn {
    fn from(value: u32) -> Self {
        Asn(value)
    }
}

/// The monitored BGP peer an event was learned from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Source {
    pub addr: IpAddr,
    pub port: u16,
    pub asn: Asn,
}

/// A validated ROA payload.
#[derive(
    Debug, Clone, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord,
)]
pub struct Vrp {
    pub asn: Asn,
    pub prefix: Prefix,
    pub max_length: u8,
}

/// The VRPs that explain a verdict. Every VRP lands in exactly one bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VrpBuckets {
    pub matched: Vec<Vrp>,
    pub unmatched_as: Vec<Vrp>,
    pub unmatched_length: Vec<Vrp>,
}

/// Route origin validation state with the numeric codes used on the wire.
/// Codes of 100 and above are errors: the validity could not be determined.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u16)]
pub enum ValidityState {
    Valid = 0,
    NotFound = 1,
    Invalid = 2,
    InvalidAs = 3,
    InvalidLength = 4,
    Error = 100,
    ErrorConnection = 101,
    ErrorTimeout = 102,
    ErrorInput = 103,
    ErrorOutput = 104,
}

impl ValidityState {
    pub fn code(self) -> u16 {
        self.into()
    }

    pub fn is_error(self) -> bool {
        self.code() >= ValidityState::Error.code()
    }

    /// State name as stored and displayed. All error codes share the name
    /// `Error` and are told apart by their code.
    pub fn name(self) -> &'static str {
        match self {
            Self::Valid => "Valid",
            Self::NotFound => "NotFound",
            Self::Invalid => "Invalid",
            Self::InvalidAs => "InvalidAS",
            Self::InvalidLength => "InvalidLength",
            Self::Error
            | Self::ErrorConnection
            | Self::ErrorTimeout
            | Self::ErrorInput
            | Self::ErrorOutput => "Error",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Valid => "At least one VRP Matches the Route Prefix",
            Self::NotFound => "No VRP Covers the Route Prefix",
            Self::Invalid => {
                "At least one VRP Matches the Route Prefix, but no VRP ASN or \
                 the Route Prefix length is greater than the maximum length \
                 allowed by VRP(s) matching this route origin ASN"
            }
            Self::InvalidAs => {
                "At least one VRP Covers the Route Prefix, but no VRP ASN \
                 matches the route origin ASN"
            }
            Self::InvalidLength => {
                "At least one VRP Covers the Route Prefix, but the Route \
                 Prefix length is greater than the maximum length allowed by \
                 VRP(s) matching this route origin ASN"
            }
            Self::Error => "Unknown validation error.",
            Self::ErrorConnection => "RPKI cache-server connection failure!",
            Self::ErrorTimeout => "RPKI cache-server connection timeout!",
            Self::ErrorInput => "RPKI cache-server input error!",
            Self::ErrorOutput => "RPKI cache-server output error!",
        }
    }
}

impl Display for ValidityState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            write!(f, "{}({})", self.name(), self.code())
        } else {
            write!(f, "{}", self.name())
        }
    }
}

/// The outcome of validating one (prefix, origin) pair. Error states carry
/// no VRP buckets.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "VerdictWire", into = "VerdictWire")]
pub struct Verdict {
    pub state: ValidityState,
    pub vrps: Option<VrpBuckets>,
}

impl Verdict {
    pub fn error(state: ValidityState) -> Self {
        Self { state, vrps: None }
    }

    pub fn not_found() -> Self {
        Self {
            state: ValidityState::NotFound,
            vrps: Some(VrpBuckets::default()),
        }
    }
}

/// The `validity` object of the pipeline and storage format.
#[derive(Serialize, Deserialize)]
struct VerdictWire {
    state: String,
    code: u16,
    description: String,
    #[serde(rename = "VRPs", default, skip_serializing_if = "Option::is_none")]
    vrps: Option<VrpBuckets>,
}

impl From<Verdict> for VerdictWire {
    fn from(v: Verdict) -> Self {
        Self {
            state: v.state.name().to_string(),
            code: v.state.code(),
            description: v.state.description().to_string(),
            vrps: v.vrps,
        }
    }
}

impl TryFrom<VerdictWire> for Verdict {
    type Error = String;

    fn try_from(w: VerdictWire) -> Result<Self, Self::Error> {
        let state = ValidityState::try_from(w.code)
            .map_err(|_| format!("unknown validity code {}", w.code))?;
        if state.name() != w.state {
            return Err(format!(
                "validity state '{}' does not match code {}",
                w.state, w.code
            ));
        }
        let vrps = if state.is_error() { None } else { w.vrps };
        Ok(Self { state, vrps })
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Announcement,
    Withdrawn,
}

/// A stored validation event. Records are never mutated: a newer record for
/// the same prefix supersedes an older one.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidityRecord {
    pub prefix: Prefix,
    pub origin: Option<Asn>,
    /// Seconds since the epoch, as observed by the route monitor.
    pub timestamp: i64,
    pub event_type: EventType,
    pub verdict: Option<Verdict>,
    pub next_hop: Option<IpAddr>,
    pub source: Option<Source>,
}

impl ValidityRecord {
    pub fn announcement(
        prefix: Prefix,
        origin: Asn,
        timestamp: i64,
        verdict: Verdict,
        next_hop: Option<IpAddr>,
        source: Option<Source>,
    ) -> Self {
        Self {
            prefix,
            origin: Some(origin),
            timestamp,
            event_type: EventType::Announcement,
            verdict: Some(verdict),
            next_hop,
            source,
        }
    }

    pub fn withdrawn(
        prefix: Prefix,
        timestamp: i64,
        source: Option<Source>,
    ) -> Self {
        Self {
            prefix,
            origin: None,
            timestamp,
            event_type: EventType::Withdrawn,
            verdict: None,
            next_hop: None,
            source,
        }
    }

    pub fn state(&self) -> Option<ValidityState> {
        self.verdict.as_ref().map(|v| v.state)
    }
}

/// Number of latest-view entries per state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StateCounts {
    pub valid: u64,
    pub not_found: u64,
    pub invalid: u64,
    pub invalid_as: u64,
    pub invalid_length: u64,
    pub error: u64,
    pub withdrawn: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: Option<ValidityState>) {
        let slot = match state {
            None => &mut self.withdrawn,
            Some(ValidityState::Valid) => &mut self.valid,
            Some(ValidityState::NotFound) => &mut self.not_found,
            Some(ValidityState::Invalid) => &mut self.invalid,
            Some(ValidityState::InvalidAs) => &mut self.invalid_as,
            Some(ValidityState::InvalidLength) => &mut self.invalid_length,
            Some(_) => &mut self.error,
        };
        *slot += 1;
    }

    /// Validated entries, i.e. everything but withdrawals.
    pub fn total(&self) -> u64 {
        self.valid
            + self.not_found
            + self.invalid
            + self.invalid_as
            + self.invalid_length
            + self.error
    }
}

/// Address space covered by prefixes in each state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AddressSpace {
    pub valid: u128,
    pub not_found: u128,
    pub invalid_as: u128,
    pub invalid_length: u128,
}

impl AddressSpace {
    pub fn add(&mut self, state: ValidityState, size: u128) {
        let slot = match state {
            ValidityState::Valid => &mut self.valid,
            ValidityState::NotFound => &mut self.not_found,
            ValidityState::InvalidAs => &mut self.invalid_as,
            ValidityState::InvalidLength => &mut self.invalid_length,
            _ => return,
        };
        *slot = slot.saturating_add(size);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FamilyStats {
    pub prefixes: StateCounts,
    pub addresses: AddressSpace,
}

/// Aggregate counts over the latest view at one point in route observation
/// time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatsSnapshot {
    /// Timestamp of the newest record that contributed to the snapshot.
    pub timestamp: i64,
    pub total: StateCounts,
    pub ipv4: FamilyStats,
    pub ipv6: FamilyStats,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_parse_zeroes_host_bits() {
        let p: Prefix = "10.1.2.3/16".parse().expect("parse");
        assert_eq!(p.to_string(), "10.1.0.0/16");
        let p: Prefix = "2001:db8::1/32".parse().expect("parse");
        assert_eq!(p.to_string(), "2001:db8::/32");
        assert!("10.0.0.0/33".parse::<Prefix>().is_err());
        assert!("10.0.0.0".parse::<Prefix>().is_err());
    }

    #[test]
    fn prefix_db_key() {
        let p: Prefix = "192.0.2.0/24".parse().expect("parse");
        let key = p.db_key();
        assert_eq!(key, vec![4, 192, 0, 2, 0, 24]);
        assert_eq!(Prefix::from_db_key(&key).expect("from key"), p);
        assert!(Prefix::from_db_key(&[9, 1, 2]).is_err());
        assert!(Prefix::from_db_key(&[6, 1, 2]).is_err());
    }

    #[test]
    fn prefix_size() {
        let p: Prefix = "10.0.0.0/24".parse().expect("parse");
        assert_eq!(p.size(), 256);
        let p: Prefix = "2001:db8::/127".parse().expect("parse");
        assert_eq!(p.size(), 2);
    }

    #[test]
    fn asn_forms() {
        assert_eq!("AS65001".parse::<Asn>(), Ok(Asn(65001)));
        assert_eq!("65001".parse::<Asn>(), Ok(Asn(65001)));
        assert!("ASX".parse::<Asn>().is_err());
        assert_eq!(
            serde_json::to_string(&Asn(3320)).expect("ser"),
            "\"AS3320\""
        );
    }

    #[test]
    fn verdict_json_shape() {
        let v = Verdict {
            state: ValidityState::InvalidAs,
            vrps: Some(VrpBuckets {
                unmatched_as: vec![Vrp {
                    asn: Asn(65002),
                    prefix: "10.0.0.0/24".parse().expect("parse"),
                    max_length: 24,
                }],
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&v).expect("ser");
        assert_eq!(json["state"], "InvalidAS");
        assert_eq!(json["code"], 3);
        assert_eq!(json["VRPs"]["unmatched_as"][0]["asn"], "AS65002");
        assert_eq!(json["VRPs"]["unmatched_as"][0]["prefix"], "10.0.0.0/24");

        let err = Verdict::error(ValidityState::ErrorTimeout);
        let json = serde_json::to_value(&err).expect("ser");
        assert_eq!(json["state"], "Error");
        assert_eq!(json["code"], 102);
        assert!(json.get("VRPs").is_none());
    }

    #[test]
    fn verdict_rejects_inconsistent_state() {
        let bad = r#"{"state":"Valid","code":3,"description":""}"#;
        assert!(serde_json::from_str::<Verdict>(bad).is_err());
        let unknown = r#"{"state":"Error","code":99,"description":""}"#;
        assert!(serde_json::from_str::<Verdict>(unknown).is_err());
    }

    #[test]
    fn state_counts() {
        let mut c = StateCounts::default();
        c.add(Some(ValidityState::Valid));
        c.add(Some(ValidityState::ErrorOutput));
        c.add(Some(ValidityState::Error));
        c.add(None);
        assert_eq!(c.valid, 1);
        assert_eq!(c.error, 2);
        assert_eq!(c.withdrawn, 1);
        assert_eq!(c.total(), 3);
    }
}
