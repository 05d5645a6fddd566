//! 2PC Core Types

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// One logical relocation run - ULID-based, unique without coordination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(ulid::Ulid);

impl OperationId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for OperationId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Which side of the relocation a branch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchRole {
    Source,
    Target,
}

impl BranchRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchRole::Source => "SOURCE",
            BranchRole::Target => "TARGET",
        }
    }

    /// Suffix used in the branch gid
    pub fn suffix(&self) -> &'static str {
        match self {
            BranchRole::Source => "src",
            BranchRole::Target => "dst",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "src" => Some(BranchRole::Source),
            "dst" => Some(BranchRole::Target),
            _ => None,
        }
    }
}

impl fmt::Display for BranchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Global transaction identifier of one branch: `<prefix>_<ulid>_<src|dst>`.
/// Both branches of an operation share the ULID but never the gid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(prefix: &str, operation: OperationId, role: BranchRole) -> Self {
        Self(format!("{}_{}_{}", prefix, operation, role.suffix()))
    }

    /// Split a gid produced by [`BranchId::new`] with the same prefix.
    /// Foreign gids yield `None`.
    pub fn parse(gid: &str, prefix: &str) -> Option<(Self, OperationId, BranchRole)> {
        let rest = gid.strip_prefix(prefix)?.strip_prefix('_')?;
        let (ulid, suffix) = rest.rsplit_once('_')?;
        let operation = ulid.parse().ok()?;
        let role = BranchRole::from_suffix(suffix)?;
        Some((Self(gid.to_string()), operation, role))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The gid as a single-quoted SQL literal
    pub fn to_sql_literal(&self) -> String {
        format!("'{}'", self.0.replace('\'', "''"))
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One moved row. `id` is carried over verbatim, never regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub id: i32,
    pub value: String,
}

impl TransferRecord {
    pub fn new(id: i32, value: impl Into<String>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}
