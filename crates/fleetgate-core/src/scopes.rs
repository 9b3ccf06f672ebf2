//! Capability scopes gating operator API access.
//!
//! A [`Scopes`] value is a bit-set over the closed set of
//! `resource:operation` capabilities. Routes declare the set of scopes that
//! *cover* them (any one suffices): listing devices is covered by either
//! `devices:read` or `devices:read-update`, so the gate for it is the union
//! of both bits and [`Scopes::has`] answers "does the caller hold at least
//! one of these".
//!
//! A *requested* scope set (for a new token or session) is allowed iff it
//! is a subset of the issuer's current scopes ([`Scopes::allows`]).

use std::fmt;
use std::ops::{BitAnd, BitOr};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The closed capability set, in canonical spelling order.
const SCOPE_NAMES: [&str; 9] = [
    "devices:read",
    "devices:read-update",
    "devices:delete",
    "users:create",
    "users:read",
    "users:read-update",
    "users:delete",
    "updates:read",
    "updates:read-update",
];

const ALL_BITS: u32 = (1 << SCOPE_NAMES.len()) - 1;

/// Bit-set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Scopes(u32);

pub const DEVICES_READ: Scopes = Scopes(1 << 0);
pub const DEVICES_READ_UPDATE: Scopes = Scopes(1 << 1);
pub const DEVICES_DELETE: Scopes = Scopes(1 << 2);
pub const USERS_CREATE: Scopes = Scopes(1 << 3);
pub const USERS_READ: Scopes = Scopes(1 << 4);
pub const USERS_READ_UPDATE: Scopes = Scopes(1 << 5);
pub const USERS_DELETE: Scopes = Scopes(1 << 6);
pub const UPDATES_READ: Scopes = Scopes(1 << 7);
pub const UPDATES_READ_UPDATE: Scopes = Scopes(1 << 8);

/// Covering sets for route gates: reading is satisfied by the read or the
/// read-update capability, writing only by read-update.
pub const SCOPE_DEVICES_R: Scopes = Scopes(DEVICES_READ.0 | DEVICES_READ_UPDATE.0);
pub const SCOPE_DEVICES_RU: Scopes = DEVICES_READ_UPDATE;
pub const SCOPE_DEVICES_D: Scopes = DEVICES_DELETE;
pub const SCOPE_USERS_R: Scopes = Scopes(USERS_READ.0 | USERS_READ_UPDATE.0);
pub const SCOPE_USERS_RU: Scopes = USERS_READ_UPDATE;
pub const SCOPE_UPDATES_R: Scopes = Scopes(UPDATES_READ.0 | UPDATES_READ_UPDATE.0);
pub const SCOPE_UPDATES_RU: Scopes = UPDATES_READ_UPDATE;

/// A scope name outside the closed capability set.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown scope: {0}")]
pub struct UnknownScope(pub String);

impl Scopes {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn all() -> Self {
        Self(ALL_BITS)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when the holder carries at least one of the covering scopes.
    #[must_use]
    pub const fn has(self, any_of: Self) -> bool {
        self.0 & any_of.0 != 0
    }

    /// True when every requested scope is held: `requested & self ==
    /// requested`.
    #[must_use]
    pub const fn allows(self, requested: Self) -> bool {
        requested.0 & self.0 == requested.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Canonical comma-joined spelling, e.g. `devices:read,updates:read`.
    #[must_use]
    pub fn to_text(self) -> String {
        let mut names = Vec::new();
        for (i, name) in SCOPE_NAMES.iter().enumerate() {
            if self.0 & (1 << i) != 0 {
                names.push(*name);
            }
        }
        names.join(",")
    }

    /// Parses the comma-joined canonical spelling. Empty text is the empty
    /// set; whitespace around entries is tolerated.
    pub fn from_text(text: &str) -> Result<Self, UnknownScope> {
        let mut scopes = Self::empty();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            scopes = scopes.union(Self::parse_one(part)?);
        }
        Ok(scopes)
    }

    /// Parses a list of scope names (configuration files carry them as
    /// arrays rather than comma-joined text).
    pub fn from_slice<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownScope> {
        let mut scopes = Self::empty();
        for name in names {
            scopes = scopes.union(Self::parse_one(name.as_ref())?);
        }
        Ok(scopes)
    }

    fn parse_one(name: &str) -> Result<Self, UnknownScope> {
        SCOPE_NAMES
            .iter()
            .position(|s| *s == name)
            .map(|i| Self(1 << i))
            .ok_or_else(|| UnknownScope(name.to_string()))
    }

    /// Enumerates every capability name.
    #[must_use]
    pub fn available() -> &'static [&'static str] {
        &SCOPE_NAMES
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl BitOr for Scopes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitAnd for Scopes {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl Serialize for Scopes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for Scopes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_text(&text).map_err(D::Error::custom)
    }
}

impl ToSql for Scopes {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_text()))
    }
}

impl FromSql for Scopes {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Self::from_text(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip_over_all_subsets() {
        for bits in 0..=ALL_BITS {
            let scopes = Scopes(bits);
            assert_eq!(Scopes::from_text(&scopes.to_text()).unwrap(), scopes);
        }
    }

    #[test]
    fn has_accepts_any_covering_scope() {
        let reader = DEVICES_READ;
        let updater = DEVICES_READ_UPDATE;
        assert!(reader.has(SCOPE_DEVICES_R));
        assert!(updater.has(SCOPE_DEVICES_R));
        assert!(!reader.has(SCOPE_DEVICES_RU));
        assert!(updater.has(SCOPE_DEVICES_RU));
    }

    #[test]
    fn allows_is_subset_check() {
        let allowed = DEVICES_READ | UPDATES_READ;
        assert!(allowed.allows(DEVICES_READ));
        assert!(allowed.allows(DEVICES_READ | UPDATES_READ));
        assert!(!allowed.allows(DEVICES_READ_UPDATE));
        assert!(!allowed.allows(DEVICES_READ | USERS_READ));
        assert!(allowed.allows(Scopes::empty()));
    }

    #[test]
    fn intersect_downscopes() {
        let token = DEVICES_READ | DEVICES_READ_UPDATE;
        let user_now = DEVICES_READ;
        let effective = token.intersect(user_now);
        assert!(effective.has(SCOPE_DEVICES_R));
        assert!(!effective.has(SCOPE_DEVICES_RU));
    }

    #[test]
    fn unknown_scope_rejected() {
        assert_eq!(
            Scopes::from_text("devices:fly"),
            Err(UnknownScope("devices:fly".into()))
        );
    }

    #[test]
    fn available_matches_bit_width() {
        assert_eq!(Scopes::available().len(), 9);
        assert_eq!(Scopes::all().to_text().split(',').count(), 9);
    }

    #[test]
    fn from_slice_parses_config_arrays() {
        let scopes = Scopes::from_slice(&["devices:read", "updates:read"]).unwrap();
        assert_eq!(scopes, DEVICES_READ | UPDATES_READ);
    }
}
