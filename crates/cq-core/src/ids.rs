//! Identifiers for CLs and Runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Internal CL identifier, allocated once per external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClId(pub i64);

impl std::fmt::Display for ClId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a change in the code-review system: `gerrit/<host>/<change>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn gerrit(host: &str, change: i64) -> Self {
        ExternalId(format!("gerrit/{host}/{change}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(host, change)` if this is a well-formed Gerrit identity.
    pub fn parse_gerrit(&self) -> Option<(&str, i64)> {
        let rest = self.0.strip_prefix("gerrit/")?;
        let (host, change) = rest.rsplit_once('/')?;
        Some((host, change.parse().ok()?))
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 2336-10-19T17:46:40Z, 10^10 seconds after 2020-01-01.
const END_OF_THE_WORLD_MS: i64 = 11_575_072_000_000;

/// Run identifier: `<project>/<inverted create time>-<attempt>-<digest>`.
///
/// The inverted time counts milliseconds down to a fixed far-future instant,
/// left-padded to 13 digits, so lexicographic order lists newest Runs first.
/// The digest covers the sorted CL IDs. The same project, create time and CL
/// set always yield the same ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(project: &str, create_time: DateTime<Utc>, attempt: u32, clids: &[ClId]) -> Self {
        let inverted = (END_OF_THE_WORLD_MS - create_time.timestamp_millis()).max(0);
        let mut sorted = clids.to_vec();
        sorted.sort();
        let mut hasher = Sha256::new();
        for clid in &sorted {
            hasher.update(clid.0.to_be_bytes());
        }
        let digest = hex::encode(&hasher.finalize()[..8]);
        RunId(format!("{project}/{inverted:013}-{attempt}-{digest}"))
    }

    /// Wrap an existing ID string without validation.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        RunId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The project prefix.
    pub fn project(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(p, _)| p)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
