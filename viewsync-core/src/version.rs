//! CVR version algebra.
//!
//! A CVR version is a pair of an upstream *state version* (the commit mark of
//! the replica snapshot queries were evaluated at) and an optional *minor
//! version* counting configuration bumps within one state version. State
//! versions are lexicographically sortable base36 strings; comparing the
//! rendered form as octet strings yields the same order as comparing the
//! numbers they encode. That property is what lets the store index and range
//! scan on `patch_version` columns directly.

use std::{cmp::Ordering, fmt, hash::Hash, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CvrError;

/// The state version of a CVR that has never synced: lexi-encoded zero.
pub const EMPTY_STATE_VERSION: &str = "00";

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encodes a number so that the string ordering of two encodings matches the
/// numeric ordering of the values.
///
/// The value is rendered in base36 and prefixed with a single base36 digit
/// carrying `digits - 1`, so longer (larger) values sort after shorter ones:
/// `0 -> "00"`, `35 -> "0z"`, `36 -> "110"`.
pub fn to_lexi_version(value: u64) -> String {
    let mut digits = Vec::new();
    let mut v = value;
    loop {
        digits.push(BASE36[(v % 36) as usize]);
        v /= 36;
        if v == 0 {
            break;
        }
    }
    let mut out = String::with_capacity(digits.len() + 1);
    out.push(BASE36[digits.len() - 1] as char);
    for b in digits.iter().rev() {
        out.push(*b as char);
    }
    out
}

/// Inverse of [`to_lexi_version`]. Rejects anything that does not round-trip.
pub fn from_lexi_version(encoded: &str) -> Result<u64, CvrError> {
    let malformed = || CvrError::InvalidVersion(encoded.to_string());
    let mut chars = encoded.bytes();
    let prefix = chars.next().ok_or_else(malformed)?;
    let declared_len = base36_digit(prefix).ok_or_else(malformed)? as usize + 1;
    if encoded.len() != declared_len + 1 {
        return Err(malformed());
    }
    let mut value: u64 = 0;
    for b in chars {
        let digit = base36_digit(b).ok_or_else(malformed)?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(malformed)?;
    }
    if to_lexi_version(value) != encoded {
        // catches padded zeroes such as "10x" claiming two digits for "x"
        return Err(malformed());
    }
    Ok(value)
}

fn base36_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'z' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// A totally ordered CVR version.
///
/// An absent minor version is equivalent to zero for ordering, equality and
/// hashing; it is simply not rendered.
#[derive(Clone, Debug)]
pub struct CvrVersion {
    pub state_version: String,
    pub minor_version: Option<u64>,
}

impl CvrVersion {
    /// The version of a freshly created CVR.
    pub fn empty() -> Self {
        Self { state_version: EMPTY_STATE_VERSION.to_string(), minor_version: None }
    }

    /// The next config-bumped version on the same state version.
    pub fn one_after(&self) -> Self {
        Self {
            state_version: self.state_version.clone(),
            minor_version: Some(self.minor_version.unwrap_or(0) + 1),
        }
    }

    /// A version at the given state version with no config bumps.
    pub fn of_state(state_version: impl Into<String>) -> Self {
        Self { state_version: state_version.into(), minor_version: None }
    }

    fn minor_or_zero(&self) -> u64 {
        self.minor_version.unwrap_or(0)
    }
}

impl PartialEq for CvrVersion {
    fn eq(&self, other: &Self) -> bool {
        self.state_version == other.state_version && self.minor_or_zero() == other.minor_or_zero()
    }
}

impl Eq for CvrVersion {}

impl Hash for CvrVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.state_version.hash(state);
        self.minor_or_zero().hash(state);
    }
}

impl Ord for CvrVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // String comparison is byte-wise, which for the base36 alphabet is
        // exactly the octet-string UTF-8 order the versions are built for.
        self.state_version
            .cmp(&other.state_version)
            .then_with(|| self.minor_or_zero().cmp(&other.minor_or_zero()))
    }
}

impl PartialOrd for CvrVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor_version {
            Some(minor) if minor > 0 => {
                write!(f, "{}:{}", self.state_version, to_lexi_version(minor))
            }
            _ => f.write_str(&self.state_version),
        }
    }
}

impl FromStr for CvrVersion {
    type Err = CvrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (state, minor) = match s.split_once(':') {
            Some((state, minor)) => (state, Some(minor)),
            None => (s, None),
        };
        if state.is_empty() || !state.bytes().all(|b| base36_digit(b).is_some()) {
            return Err(CvrError::InvalidVersion(s.to_string()));
        }
        let minor_version = match minor {
            Some(encoded) => match from_lexi_version(encoded)? {
                0 => None,
                n => Some(n),
            },
            None => None,
        };
        Ok(Self { state_version: state.to_string(), minor_version })
    }
}

impl Serialize for CvrVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CvrVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
