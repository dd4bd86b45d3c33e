//! Core domain types shared across the pipeline crates.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EgressosError, Result};
use crate::identity::JoinKeyMode;

/// Current schema version for the persisted manifests.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Bracket label used when an age cannot be derived.
pub const UNKNOWN_BRACKET: &str = "unknown";

/// Matches `YYYY-MM` with a valid month number.
static MONTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-(0[1-9]|1[0-2])$").expect("month regex"));

// ---------------------------------------------------------------------------
// Month
// ---------------------------------------------------------------------------

/// A registry publication month (`YYYY-MM`). Orders chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month(String);

impl Month {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Month {
    type Err = EgressosError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if MONTH_RE.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(EgressosError::validation(format!(
                "invalid month '{s}', expected YYYY-MM"
            )))
        }
    }
}

impl TryFrom<String> for Month {
    type Error = EgressosError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Month> for String {
    fn from(m: Month) -> Self {
        m.0
    }
}

impl std::fmt::Display for Month {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// AgeBrackets
// ---------------------------------------------------------------------------

/// Age bracket boundaries: strictly ascending inclusive lower bounds.
///
/// Bounds `[18, 25, 65]` produce `<18`, `18-24`, `25-64` and `65+`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct AgeBrackets {
    bounds: Vec<u32>,
}

impl AgeBrackets {
    pub fn new(bounds: Vec<u32>) -> Result<Self> {
        if bounds.is_empty() {
            return Err(EgressosError::config("age bracket bounds must not be empty"));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EgressosError::config(format!(
                "age bracket bounds must be strictly ascending, got {bounds:?}"
            )));
        }
        Ok(Self { bounds })
    }

    /// Decade bins: `0-9`, `10-19`, ..., `80-89`, `90+`.
    pub fn decades() -> Self {
        Self {
            bounds: (0..=90).step_by(10).collect(),
        }
    }

    pub fn bounds(&self) -> &[u32] {
        &self.bounds
    }

    /// Bracket label for an age, or [`UNKNOWN_BRACKET`] when absent.
    pub fn label_for(&self, age: Option<u32>) -> String {
        let Some(age) = age else {
            return UNKNOWN_BRACKET.to_string();
        };
        let first = self.bounds[0];
        if age < first {
            return format!("<{first}");
        }
        let idx = self.bounds.partition_point(|&b| b <= age) - 1;
        match self.bounds.get(idx + 1) {
            Some(&next) => format!("{}-{}", self.bounds[idx], next - 1),
            None => format!("{}+", self.bounds[idx]),
        }
    }
}

impl Default for AgeBrackets {
    fn default() -> Self {
        Self::decades()
    }
}

impl TryFrom<Vec<u32>> for AgeBrackets {
    type Error = EgressosError;

    fn try_from(bounds: Vec<u32>) -> Result<Self> {
        Self::new(bounds)
    }
}

impl From<AgeBrackets> for Vec<u32> {
    fn from(b: AgeBrackets) -> Self {
        b.bounds
    }
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// A registry archive consumed by a normalization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// File name (no directory).
    pub name: String,
    /// Size on disk in bytes.
    pub size_bytes: u64,
}

/// `_manifest.json` stored next to the normalized registry datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub schema_version: u32,
    /// Publication month the archives came from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<Month>,
    /// Archives in processing order.
    pub archives: Vec<ArchiveEntry>,
    /// Join key derivation used for `id_hash`.
    pub join_key: JoinKeyMode,
    /// Fingerprint of the pseudonymization key used for `id_hash`.
    pub key_fingerprint: String,
    /// Data rows read across all archives.
    pub rows_read: usize,
    /// Rows skipped as malformed.
    pub malformed_rows: usize,
    /// Distinct identifiers (rows in `socios.parquet`).
    pub distinct_ids: usize,
    pub generated_at: DateTime<Utc>,
}

impl RegistryManifest {
    /// Whether a run over `archives` with this key setup would reproduce these outputs.
    pub fn matches_inputs(
        &self,
        archives: &[ArchiveEntry],
        key_fingerprint: &str,
        join_key: JoinKeyMode,
    ) -> bool {
        self.schema_version == CURRENT_SCHEMA_VERSION
            && self.archives == archives
            && self.key_fingerprint == key_fingerprint
            && self.join_key == join_key
    }
}

/// Checksum record for a written output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    /// Path relative to the dataset root.
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// `_manifest.json` stored at the root of the enriched dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputManifest {
    pub schema_version: u32,
    pub dataset: String,
    pub record_count: usize,
    pub founder_count: usize,
    pub name_match_count: usize,
    /// True when the registry was absent or empty and every flag defaulted.
    pub degraded: bool,
    /// Record count per age bracket.
    pub brackets: BTreeMap<String, usize>,
    pub files: Vec<FileChecksum>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_parsing() {
        assert_eq!("2025-09".parse::<Month>().unwrap().as_str(), "2025-09");
        assert!("2025-13".parse::<Month>().is_err());
        assert!("2025-9".parse::<Month>().is_err());
        assert!("latest".parse::<Month>().is_err());
    }

    #[test]
    fn months_order_chronologically() {
        let mut months: Vec<Month> = ["2025-10", "2024-12", "2025-01"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        months.sort();
        assert_eq!(months.last().unwrap().as_str(), "2025-10");
    }

    #[test]
    fn decade_brackets() {
        let b = AgeBrackets::decades();
        assert_eq!(b.label_for(Some(36)), "30-39");
        assert_eq!(b.label_for(Some(30)), "30-39");
        assert_eq!(b.label_for(Some(0)), "0-9");
        assert_eq!(b.label_for(Some(95)), "90+");
        assert_eq!(b.label_for(None), UNKNOWN_BRACKET);
    }

    #[test]
    fn custom_brackets() {
        let b = AgeBrackets::new(vec![18, 25, 35, 45, 55, 65]).unwrap();
        assert_eq!(b.label_for(Some(17)), "<18");
        assert_eq!(b.label_for(Some(18)), "18-24");
        assert_eq!(b.label_for(Some(44)), "35-44");
        assert_eq!(b.label_for(Some(70)), "65+");
    }

    #[test]
    fn invalid_brackets_rejected() {
        assert!(AgeBrackets::new(vec![]).is_err());
        assert!(AgeBrackets::new(vec![10, 10]).is_err());
        assert!(AgeBrackets::new(vec![20, 10]).is_err());
    }

    #[test]
    fn brackets_deserialize_from_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            bounds: AgeBrackets,
        }
        let w: Wrapper = toml::from_str("bounds = [0, 30, 60]").unwrap();
        assert_eq!(w.bounds.label_for(Some(45)), "30-59");
        assert!(toml::from_str::<Wrapper>("bounds = [5, 1]").is_err());
    }

    #[test]
    fn registry_manifest_fixture_validates() {
        let fixture =
            std::fs::read_to_string("../../../fixtures/json/registry_manifest.fixture.json")
                .expect("read fixture");
        let parsed: RegistryManifest =
            serde_json::from_str(&fixture).expect("deserialize fixture manifest");
        assert_eq!(parsed.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(parsed.month.as_ref().map(Month::as_str), Some("2025-09"));
        assert_eq!(parsed.archives.len(), 2);
        assert_eq!(parsed.join_key, JoinKeyMode::MaskedCpf);

        let archives = parsed.archives.clone();
        let fingerprint = parsed.key_fingerprint.clone();
        assert!(parsed.matches_inputs(&archives, &fingerprint, JoinKeyMode::MaskedCpf));
        assert!(!parsed.matches_inputs(&archives, &fingerprint, JoinKeyMode::Full));
        assert!(!parsed.matches_inputs(&archives[..1], &fingerprint, JoinKeyMode::MaskedCpf));
    }
}
