//! Enrichment joiner.
//!
//! Joins roster rows against the normalized registry by pseudonymized join
//! key and derives the analytics fields: `person_id`, `founder_partner`,
//! `partner_by_name`, `age` and `age_bracket`.
//!
//! `founder_partner` is decided by the identifier alone. `partner_by_name`
//! is an informational token-set similarity match against registry names.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use chrono::{Datelike, NaiveDate};
use egressos_registry::{MANIFEST_FILE, SOCIOS_FILE, SOCIOS_NAMES_FILE};
use egressos_shared::{
    AgeBrackets, EgressosError, IdentityHasher, JoinKeyMode, PseudonymId, Result,
    clean_identifier, normalize_name, token_set_similarity,
};
use egressos_storage::schema;
use tracing::{info, instrument, warn};

use crate::roster::AlumniRecord;

// ---------------------------------------------------------------------------
// Name index
// ---------------------------------------------------------------------------

/// Names with fewer tokens never take part in name matching.
const MIN_NAME_TOKENS: usize = 2;

/// Postings lists, rarest first, whose names are scored for a query.
const CANDIDATE_TOKENS: usize = 2;

/// Normalized registry names with a token index for similarity lookups.
///
/// A query is scored only against names sharing one of its two rarest
/// indexed tokens, so any name sharing all but one of them is a candidate.
#[derive(Debug, Clone, Default)]
struct NameIndex {
    exact: HashSet<String>,
    names: Vec<String>,
    postings: HashMap<String, Vec<usize>>,
}

impl NameIndex {
    fn insert(&mut self, name: String) {
        let tokens: BTreeSet<&str> = name.split_whitespace().collect();
        if tokens.len() < MIN_NAME_TOKENS || self.exact.contains(&name) {
            return;
        }
        let slot = self.names.len();
        for token in tokens {
            self.postings.entry(token.to_string()).or_default().push(slot);
        }
        self.exact.insert(name.clone());
        self.names.push(name);
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn matches(&self, normalized: &str, threshold: f64) -> bool {
        let tokens: BTreeSet<&str> = normalized.split_whitespace().collect();
        if tokens.len() < MIN_NAME_TOKENS {
            return false;
        }
        if self.exact.contains(normalized) {
            return true;
        }

        let mut lists: Vec<&Vec<usize>> = tokens
            .iter()
            .filter_map(|token| self.postings.get(*token))
            .collect();
        lists.sort_by_key(|list| list.len());

        let mut seen = HashSet::new();
        lists
            .into_iter()
            .take(CANDIDATE_TOKENS)
            .flatten()
            .filter(|slot| seen.insert(**slot))
            .any(|slot| token_set_similarity(normalized, &self.names[*slot]) >= threshold)
    }
}

impl FromIterator<String> for NameIndex {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut index = Self::default();
        for name in iter {
            index.insert(name);
        }
        index
    }
}

// ---------------------------------------------------------------------------
// Registry index
// ---------------------------------------------------------------------------

/// Lookup sets loaded from the normalized registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
    socios: HashSet<String>,
    names: NameIndex,
    join_key: Option<JoinKeyMode>,
    key_fingerprint: Option<String>,
}

impl RegistryIndex {
    /// Build an index from in-memory values.
    pub fn from_parts(
        socios: impl IntoIterator<Item = PseudonymId>,
        names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            socios: socios.into_iter().map(PseudonymId::into_string).collect(),
            names: names.into_iter().map(|n| normalize_name(&n)).collect(),
            join_key: None,
            key_fingerprint: None,
        }
    }

    /// Load the registry datasets in `dir`. Returns `None` when
    /// `socios.parquet` does not exist.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let socios_path = dir.join(SOCIOS_FILE);
        if !socios_path.is_file() {
            return Ok(None);
        }

        let batches = egressos_storage::read_parquet(&socios_path)?;
        let socios: HashSet<String> = egressos_storage::collect_strings(&batches, schema::ID_HASH)?
            .into_iter()
            .collect();

        let names_path = dir.join(SOCIOS_NAMES_FILE);
        let names: NameIndex = if names_path.is_file() {
            let batches = egressos_storage::read_parquet(&names_path)?;
            egressos_storage::collect_strings(&batches, schema::NAME)?
                .into_iter()
                .collect()
        } else {
            warn!(path = %names_path.display(), "registry name dataset missing");
            NameIndex::default()
        };

        let manifest = egressos_registry::load_manifest(dir)?;
        if manifest.is_none() {
            warn!(file = MANIFEST_FILE, "registry manifest missing, key compatibility unchecked");
        }

        info!(ids = socios.len(), names = names.len(), "registry index loaded");
        Ok(Some(Self {
            socios,
            names,
            join_key: manifest.as_ref().map(|m| m.join_key),
            key_fingerprint: manifest.map(|m| m.key_fingerprint),
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.socios.is_empty()
    }

    pub fn len(&self) -> usize {
        self.socios.len()
    }

    pub fn contains(&self, id_hash: &PseudonymId) -> bool {
        self.socios.contains(id_hash.as_str())
    }

    /// Whether a registry name scores at least `threshold` against the
    /// normalized `name`.
    pub fn matches_name(&self, normalized: &str, threshold: f64) -> bool {
        self.names.matches(normalized, threshold)
    }

    /// Fail when the registry was hashed with another key or join mode.
    pub fn check_compatible(&self, hasher: &IdentityHasher, join_key: JoinKeyMode) -> Result<()> {
        if let Some(mode) = self.join_key {
            if mode != join_key {
                return Err(EgressosError::config(format!(
                    "registry was prepared with join key '{mode}' but '{join_key}' is configured; \
                     rerun prepare-socios"
                )));
            }
        }
        if let Some(fingerprint) = &self.key_fingerprint {
            if *fingerprint != hasher.fingerprint() {
                return Err(EgressosError::config(
                    "registry was prepared with a different salt; rerun prepare-socios --force",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// One anonymized output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedAlumniRecord {
    pub person_id: Option<PseudonymId>,
    pub founder_partner: bool,
    pub partner_by_name: bool,
    pub age: Option<u32>,
    pub age_bracket: String,
    pub course: Option<String>,
    pub course_code: Option<String>,
    pub level: Option<String>,
    pub course_status: Option<String>,
    pub entry_date: Option<NaiveDate>,
    pub graduation_date: Option<NaiveDate>,
}

/// Non-fatal conditions recorded during enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentWarning {
    /// The registry was absent or empty; every flag defaulted to false.
    JoinDegraded { reason: String },
}

impl std::fmt::Display for EnrichmentWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JoinDegraded { reason } => write!(f, "join degraded: {reason}"),
        }
    }
}

/// Counters for an enrichment run.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentReport {
    pub rows: usize,
    pub founders: usize,
    pub name_matches: usize,
    pub missing_identifiers: usize,
    pub unknown_ages: usize,
    pub brackets: BTreeMap<String, usize>,
    pub warnings: Vec<EnrichmentWarning>,
}

impl EnrichmentReport {
    pub fn is_degraded(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, EnrichmentWarning::JoinDegraded { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct Enrichment {
    pub records: Vec<EnrichedAlumniRecord>,
    pub report: EnrichmentReport,
}

/// Knobs injected into [`enrich`].
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    /// Reference date for ages.
    pub as_of: NaiveDate,
    pub brackets: AgeBrackets,
    pub join_key: JoinKeyMode,
    /// Minimum token-set similarity for `partner_by_name`.
    pub name_match_threshold: f64,
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Full years between `birth` and `as_of`; `None` for future birth dates.
pub fn age_on(birth: NaiveDate, as_of: NaiveDate) -> Option<u32> {
    if birth > as_of {
        return None;
    }
    let mut years = as_of.year() - birth.year();
    if (as_of.month(), as_of.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

/// Enrich `roster` in order. `index` is `None` when no registry exists.
#[instrument(skip_all, fields(rows = roster.len(), as_of = %options.as_of))]
pub fn enrich(
    roster: &[AlumniRecord],
    index: Option<&RegistryIndex>,
    hasher: &IdentityHasher,
    options: &EnrichOptions,
) -> Result<Enrichment> {
    let mut report = EnrichmentReport::default();

    let index = match index {
        Some(index) if !index.is_empty() => {
            index.check_compatible(hasher, options.join_key)?;
            Some(index)
        }
        Some(_) => {
            degrade(&mut report, "registry is empty");
            None
        }
        None => {
            degrade(&mut report, "registry datasets not found");
            None
        }
    };

    let records: Vec<EnrichedAlumniRecord> = roster
        .iter()
        .map(|row| {
            let cleaned = row
                .identifier
                .as_deref()
                .and_then(|raw| clean_identifier(raw, options.join_key));
            let person_id = cleaned.as_deref().map(|id| hasher.hash(id));
            let join_hash = cleaned
                .as_deref()
                .and_then(|id| options.join_key.join_key(id))
                .map(|key| hasher.hash(&key));

            let founder_partner = match (index, &join_hash) {
                (Some(index), Some(hash)) => index.contains(hash),
                _ => false,
            };
            let partner_by_name = match (index, &row.name) {
                (Some(index), Some(name)) => {
                    index.matches_name(&normalize_name(name), options.name_match_threshold)
                }
                _ => false,
            };

            let age = row
                .birth_date
                .and_then(|birth| age_on(birth, options.as_of))
                .or(row.age);
            let age_bracket = options.brackets.label_for(age);

            report.rows += 1;
            report.founders += usize::from(founder_partner);
            report.name_matches += usize::from(partner_by_name);
            report.missing_identifiers += usize::from(person_id.is_none());
            report.unknown_ages += usize::from(age.is_none());
            *report.brackets.entry(age_bracket.clone()).or_default() += 1;

            EnrichedAlumniRecord {
                person_id,
                founder_partner,
                partner_by_name,
                age,
                age_bracket,
                course: row.course.clone(),
                course_code: row.course_code.clone(),
                level: row.level.clone(),
                course_status: row.course_status.clone(),
                entry_date: row.entry_date,
                graduation_date: row.graduation_date,
            }
        })
        .collect();

    info!(
        rows = report.rows,
        founders = report.founders,
        name_matches = report.name_matches,
        missing_identifiers = report.missing_identifiers,
        unknown_ages = report.unknown_ages,
        degraded = report.is_degraded(),
        "enrichment completed"
    );

    Ok(Enrichment { records, report })
}

fn degrade(report: &mut EnrichmentReport, reason: &str) {
    warn!(reason, "founder/partner join degraded, all flags default to false");
    report.warnings.push(EnrichmentWarning::JoinDegraded {
        reason: reason.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> IdentityHasher {
        IdentityHasher::new("enrichment-test-salt").unwrap()
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn options(join_key: JoinKeyMode) -> EnrichOptions {
        EnrichOptions {
            as_of: as_of(),
            brackets: AgeBrackets::decades(),
            join_key,
            name_match_threshold: 0.92,
        }
    }

    fn alumnus(id: Option<&str>, birth: Option<(i32, u32, u32)>) -> AlumniRecord {
        AlumniRecord {
            identifier: id.map(str::to_string),
            birth_date: birth.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            course: Some("Engenharia".into()),
            ..AlumniRecord::default()
        }
    }

    #[test]
    fn full_identifier_match_sets_founder_flag() {
        let h = hasher();
        let index = RegistryIndex::from_parts([h.hash("123")], Vec::<String>::new());
        let roster = [alumnus(Some("123"), Some((1990, 1, 1)))];

        let out = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::Full)).unwrap();
        let row = &out.records[0];
        assert_eq!(row.person_id, Some(h.hash("123")));
        assert!(row.founder_partner);
        assert_eq!(row.age, Some(36));
        assert_eq!(row.age_bracket, "30-39");
        assert!(out.report.warnings.is_empty());
        assert_eq!(out.report.founders, 1);
    }

    #[test]
    fn empty_registry_degrades_without_error() {
        let h = hasher();
        let index = RegistryIndex::default();
        let roster = [alumnus(Some("999"), None)];

        let out = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::Full)).unwrap();
        let row = &out.records[0];
        assert_eq!(row.person_id, Some(h.hash("999")));
        assert!(!row.founder_partner);
        assert_eq!(row.age_bracket, "unknown");
        assert!(out.report.is_degraded());

        let out = enrich(&roster, None, &h, &options(JoinKeyMode::Full)).unwrap();
        assert!(out.report.is_degraded());
        assert!(!out.records[0].founder_partner);
    }

    #[test]
    fn zero_overlap_flags_nobody() {
        let h = hasher();
        let index = RegistryIndex::from_parts(
            [h.hash("000111"), h.hash("222333")],
            vec!["FULANO DE TAL".to_string()],
        );
        let roster = [
            alumnus(Some("529.982.247-25"), Some((1980, 5, 5))),
            alumnus(Some("111.444.777-35"), Some((2000, 12, 31))),
        ];
        let out = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap();
        assert!(out.records.iter().all(|r| !r.founder_partner && !r.partner_by_name));
        assert_eq!(out.report.founders, 0);
    }

    #[test]
    fn masked_join_key_matches_registry_fragment() {
        let h = hasher();
        let index = RegistryIndex::from_parts([h.hash("982247")], Vec::<String>::new());
        let roster = [
            alumnus(Some("529.982.247-25"), Some((1990, 1, 1))),
            alumnus(Some("111.444.777-35"), Some((1990, 1, 1))),
        ];
        let out = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap();
        assert!(out.records[0].founder_partner);
        assert!(!out.records[1].founder_partner);
        assert_eq!(out.records[0].person_id, Some(h.hash("52998224725")));
    }

    #[test]
    fn invalid_identifier_yields_null_person_id() {
        let h = hasher();
        let index = RegistryIndex::from_parts([h.hash("456789")], Vec::<String>::new());
        let roster = [alumnus(Some("123.456.789-00"), None), alumnus(None, None)];
        let out = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap();
        assert!(out.records.iter().all(|r| r.person_id.is_none() && !r.founder_partner));
        assert_eq!(out.report.missing_identifiers, 2);
    }

    #[test]
    fn name_match_is_informational() {
        let h = hasher();
        let index = RegistryIndex::from_parts([h.hash("000111")], vec!["ANA MARIA SOUZA".to_string()]);
        let mut row = alumnus(Some("529.982.247-25"), None);
        row.name = Some("  Ána Maria  Souza".into());
        let out = enrich(&[row], Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap();
        assert!(out.records[0].partner_by_name);
        assert!(!out.records[0].founder_partner);
        assert_eq!(out.report.name_matches, 1);
    }

    #[test]
    fn near_miss_names_match_and_distant_names_do_not() {
        let h = hasher();
        let index = RegistryIndex::from_parts(
            [h.hash("000111")],
            vec![
                "ANA MARIA SOUZA".to_string(),
                "CARLOS EDUARDO LIMA".to_string(),
            ],
        );
        let named = |name: &str| {
            let mut row = alumnus(Some("529.982.247-25"), None);
            row.name = Some(name.into());
            row
        };
        let roster = [
            named("Ana Maria Sousa"),
            named("Souza Ana Maria"),
            named("João Pereira"),
            named("Ana"),
        ];

        let out = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap();
        let flags: Vec<bool> = out.records.iter().map(|r| r.partner_by_name).collect();
        assert_eq!(flags, vec![true, true, false, false]);
        assert!(out.records.iter().all(|r| !r.founder_partner));
        assert_eq!(out.report.name_matches, 2);
    }

    #[test]
    fn name_threshold_is_configurable() {
        let index = RegistryIndex::from_parts(Vec::new(), vec!["ANA MARIA SOUZA".to_string()]);
        assert!(index.matches_name("ANA MARIA SOUSA", 0.92));
        assert!(!index.matches_name("ANA MARIA SOUSA", 0.99));
        assert!(index.matches_name("ANA MARIA SOUZA", 1.0));
        assert!(!index.matches_name("MARIA", 0.0));
    }

    #[test]
    fn explicit_age_used_without_birth_date() {
        let h = hasher();
        let mut row = alumnus(Some("123"), None);
        row.age = Some(41);
        let out = enrich(&[row], None, &h, &options(JoinKeyMode::Full)).unwrap();
        assert_eq!(out.records[0].age, Some(41));
        assert_eq!(out.records[0].age_bracket, "40-49");
    }

    #[test]
    fn roster_order_is_preserved() {
        let h = hasher();
        let roster: Vec<AlumniRecord> = ["1", "2", "3", "4"]
            .iter()
            .map(|&id| alumnus(Some(id), None))
            .collect();
        let out = enrich(&roster, None, &h, &options(JoinKeyMode::Full)).unwrap();
        let ids: Vec<_> = out.records.iter().map(|r| r.person_id.clone()).collect();
        let expected: Vec<_> = ["1", "2", "3", "4"].iter().map(|id| Some(h.hash(id))).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn age_counts_full_years() {
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        assert_eq!(age_on(d(1990, 10, 18), as_of()), Some(36));
        assert_eq!(age_on(d(1990, 10, 19), as_of()), Some(35));
        assert_eq!(age_on(d(2000, 2, 29), d(2001, 2, 28)), Some(0));
        assert_eq!(age_on(d(2030, 1, 1), as_of()), None);
    }

    #[test]
    fn incompatible_registry_is_config_error() {
        let h = hasher();
        let mut index = RegistryIndex::from_parts([h.hash("982247")], Vec::<String>::new());
        index.key_fingerprint = Some("not-this-salt".into());
        let roster = [alumnus(Some("529.982.247-25"), None)];
        let err = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap_err();
        assert!(matches!(err, EgressosError::Config { .. }), "got {err:?}");

        index.key_fingerprint = Some(h.fingerprint());
        index.join_key = Some(JoinKeyMode::Full);
        let err = enrich(&roster, Some(&index), &h, &options(JoinKeyMode::MaskedCpf)).unwrap_err();
        assert!(err.to_string().contains("join key"));
    }
}
