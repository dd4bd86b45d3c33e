//! Registry normalization: partner archives to pseudonymized datasets.
//!
//! Reads the partner archives in file-name order, keeps natural-person
//! partners, reduces their identifiers to join keys, deduplicates them
//! (first seen wins) and persists:
//! - `socios.parquet` (`id_hash`)
//! - `socios_nomes.parquet` (`id_hash`, `name`)
//! - `_manifest.json` ([`RegistryManifest`])

mod reader;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::StringArray;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use egressos_shared::{
    ArchiveEntry, CURRENT_SCHEMA_VERSION, EgressosError, IdentityHasher, JoinKeyMode, Month,
    PseudonymId, RegistryManifest, Result, digits_only, normalize_name,
};
use egressos_storage::schema;
use tracing::{info, instrument, warn};

pub use reader::{PARTNER_COLUMNS, PartnerType, RegistryRecord, Row, decode_latin1, parse_row, read_archive};

/// Deduplicated identifier dataset.
pub const SOCIOS_FILE: &str = "socios.parquet";
/// Identifier to name dataset.
pub const SOCIOS_NAMES_FILE: &str = "socios_nomes.parquet";
/// Registry manifest file name.
pub const MANIFEST_FILE: &str = "_manifest.json";

/// Minimum identifier digits for a partner to contribute a join key.
const MIN_IDENTIFIER_DIGITS: usize = 6;

/// File-name prefix of the partner archives.
const PARTNER_ARCHIVE_PREFIX: &str = "socios";

/// Whether an archive file name belongs to the partner dataset.
pub fn is_partner_archive(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|n| n.starts_with(PARTNER_ARCHIVE_PREFIX) && n.ends_with(".zip"))
}

// ---------------------------------------------------------------------------
// Normalized output
// ---------------------------------------------------------------------------

/// Counters from a normalization run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub archives: usize,
    /// Every data row seen, malformed ones included.
    pub rows_read: usize,
    pub malformed_rows: usize,
    /// Natural-person rows with a usable join key.
    pub natural_persons: usize,
    pub distinct_ids: usize,
}

/// In-memory result of normalization.
#[derive(Debug, Clone)]
pub struct NormalizedRegistry {
    /// Distinct join-key hashes, sorted.
    pub socios: Vec<PseudonymId>,
    /// First-seen normalized name per join-key hash.
    pub names: BTreeMap<PseudonymId, String>,
    pub archives: Vec<ArchiveEntry>,
    pub join_key: JoinKeyMode,
    pub key_fingerprint: String,
    pub stats: NormalizeStats,
}

/// Result of [`prepare`].
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub manifest: RegistryManifest,
    /// True when the existing outputs matched the inputs and were kept.
    pub reused: bool,
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Turns partner archives into a [`NormalizedRegistry`].
#[derive(Debug, Clone)]
pub struct Normalizer {
    hasher: IdentityHasher,
    join_key: JoinKeyMode,
    max_malformed_ratio: f64,
}

impl Normalizer {
    pub fn new(hasher: IdentityHasher, join_key: JoinKeyMode, max_malformed_ratio: f64) -> Self {
        Self {
            hasher,
            join_key,
            max_malformed_ratio,
        }
    }

    /// Normalize `archives`, processed in file-name order.
    #[instrument(skip_all, fields(archives = archives.len(), join_key = %self.join_key))]
    pub fn normalize(&self, archives: &[PathBuf]) -> Result<NormalizedRegistry> {
        let ordered = sorted_by_name(archives);
        let entries = archive_entries(&ordered)?;

        let mut stats = NormalizeStats {
            archives: ordered.len(),
            ..NormalizeStats::default()
        };
        let mut seen: HashSet<PseudonymId> = HashSet::new();
        let mut names: BTreeMap<PseudonymId, String> = BTreeMap::new();

        for archive in &ordered {
            let before = stats.rows_read;
            read_archive(archive, |row| {
                stats.rows_read += 1;
                match row {
                    Row::Malformed => stats.malformed_rows += 1,
                    Row::Valid(record) => {
                        if let Some(id_hash) = self.partner_key(&record) {
                            stats.natural_persons += 1;
                            if seen.insert(id_hash.clone()) {
                                names.insert(id_hash, normalize_name(&record.name));
                            }
                        }
                    }
                }
            })?;
            info!(
                archive = %archive.display(),
                rows = stats.rows_read - before,
                "archive normalized"
            );
        }

        self.check_quality(&stats)?;

        let mut socios: Vec<PseudonymId> = seen.into_iter().collect();
        socios.sort();
        stats.distinct_ids = socios.len();

        info!(
            rows_read = stats.rows_read,
            malformed = stats.malformed_rows,
            natural_persons = stats.natural_persons,
            distinct_ids = stats.distinct_ids,
            "registry normalized"
        );

        Ok(NormalizedRegistry {
            socios,
            names,
            archives: entries,
            join_key: self.join_key,
            key_fingerprint: self.hasher.fingerprint(),
            stats,
        })
    }

    /// Join-key hash of a natural-person partner with enough identifier digits.
    fn partner_key(&self, record: &RegistryRecord) -> Option<PseudonymId> {
        if record.partner_type != PartnerType::NaturalPerson {
            return None;
        }
        let digits = digits_only(&record.identifier);
        if digits.len() < MIN_IDENTIFIER_DIGITS {
            return None;
        }
        self.join_key
            .join_key(&digits)
            .map(|key| self.hasher.hash(&key))
    }

    fn check_quality(&self, stats: &NormalizeStats) -> Result<()> {
        if stats.rows_read == 0 {
            warn!("registry archives contained no rows");
            return Ok(());
        }
        let ratio = stats.malformed_rows as f64 / stats.rows_read as f64;
        if ratio > self.max_malformed_ratio {
            return Err(EgressosError::DataQuality {
                malformed: stats.malformed_rows,
                total: stats.rows_read,
                threshold: self.max_malformed_ratio,
            });
        }
        if stats.malformed_rows > 0 {
            warn!(
                malformed = stats.malformed_rows,
                total = stats.rows_read,
                "malformed registry rows skipped"
            );
        }
        Ok(())
    }

    pub fn join_key(&self) -> JoinKeyMode {
        self.join_key
    }

    pub fn key_fingerprint(&self) -> String {
        self.hasher.fingerprint()
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Write both datasets and the manifest into `out_dir`.
///
/// The three files are built in a staging sibling and swapped in together,
/// so readers never see datasets from one run with the manifest of another.
#[instrument(skip_all, fields(out_dir = %out_dir.display()))]
pub fn persist(
    registry: &NormalizedRegistry,
    out_dir: &Path,
    month: Option<&Month>,
) -> Result<RegistryManifest> {
    let staging = egressos_storage::create_staging_dir(out_dir)?;

    let manifest = match write_datasets(registry, &staging, month) {
        Ok(manifest) => manifest,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    if let Err(e) = egressos_storage::replace_dir(&staging, out_dir) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    info!(distinct_ids = manifest.distinct_ids, "registry datasets persisted");
    Ok(manifest)
}

fn write_datasets(
    registry: &NormalizedRegistry,
    out_dir: &Path,
    month: Option<&Month>,
) -> Result<RegistryManifest> {
    let ids: Vec<&str> = registry.socios.iter().map(PseudonymId::as_str).collect();
    let socios_schema = schema::socios_schema();
    let socios = RecordBatch::try_new(socios_schema.clone(), vec![Arc::new(StringArray::from(ids))])
        .map_err(|e| EgressosError::Storage(format!("build {SOCIOS_FILE} batch: {e}")))?;
    egressos_storage::write_parquet(&out_dir.join(SOCIOS_FILE), &socios_schema, &[socios])?;

    let (name_ids, name_values): (Vec<&str>, Vec<&str>) = registry
        .names
        .iter()
        .map(|(id, name)| (id.as_str(), name.as_str()))
        .unzip();
    let names_schema = schema::socios_names_schema();
    let names = RecordBatch::try_new(
        names_schema.clone(),
        vec![
            Arc::new(StringArray::from(name_ids)),
            Arc::new(StringArray::from(name_values)),
        ],
    )
    .map_err(|e| EgressosError::Storage(format!("build {SOCIOS_NAMES_FILE} batch: {e}")))?;
    egressos_storage::write_parquet(&out_dir.join(SOCIOS_NAMES_FILE), &names_schema, &[names])?;

    let manifest = RegistryManifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        month: month.cloned(),
        archives: registry.archives.clone(),
        join_key: registry.join_key,
        key_fingerprint: registry.key_fingerprint.clone(),
        rows_read: registry.stats.rows_read,
        malformed_rows: registry.stats.malformed_rows,
        distinct_ids: registry.stats.distinct_ids,
        generated_at: Utc::now(),
    };
    egressos_storage::write_json(&out_dir.join(MANIFEST_FILE), &manifest)?;
    Ok(manifest)
}

/// Read the registry manifest in `out_dir`, if any.
pub fn load_manifest(out_dir: &Path) -> Result<Option<RegistryManifest>> {
    egressos_storage::read_json(&out_dir.join(MANIFEST_FILE))
}

/// Normalize and persist, unless the outputs in `out_dir` were produced from
/// the same archives with the same key setup (and `force` is not set).
///
/// Fails with [`EgressosError::NotFound`] when `archives` is empty; the
/// existing outputs are left as they are.
#[instrument(skip_all, fields(out_dir = %out_dir.display(), force))]
pub fn prepare(
    normalizer: &Normalizer,
    archives: &[PathBuf],
    out_dir: &Path,
    month: Option<&Month>,
    force: bool,
) -> Result<PrepareOutcome> {
    if archives.is_empty() {
        warn!("no partner archives selected, keeping existing registry");
        return Err(EgressosError::NotFound(
            "no partner archives to normalize; check max_files and prefixes".into(),
        ));
    }

    if !force {
        let entries = archive_entries(&sorted_by_name(archives))?;
        let outputs_exist =
            out_dir.join(SOCIOS_FILE).is_file() && out_dir.join(SOCIOS_NAMES_FILE).is_file();
        if outputs_exist {
            if let Some(manifest) = load_manifest(out_dir)? {
                if manifest.matches_inputs(
                    &entries,
                    &normalizer.key_fingerprint(),
                    normalizer.join_key(),
                ) {
                    info!(
                        distinct_ids = manifest.distinct_ids,
                        "registry inputs unchanged, reusing outputs"
                    );
                    return Ok(PrepareOutcome {
                        manifest,
                        reused: true,
                    });
                }
            }
        }
    }

    let registry = normalizer.normalize(archives)?;
    let manifest = persist(&registry, out_dir, month)?;
    Ok(PrepareOutcome {
        manifest,
        reused: false,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sorted_by_name(archives: &[PathBuf]) -> Vec<PathBuf> {
    let mut ordered = archives.to_vec();
    ordered.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    ordered
}

/// Name and size of each archive, in the given order.
pub fn archive_entries(archives: &[PathBuf]) -> Result<Vec<ArchiveEntry>> {
    archives
        .iter()
        .map(|path| {
            let meta = std::fs::metadata(path).map_err(|e| EgressosError::io(path, e))?;
            Ok(ArchiveEntry {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size_bytes: meta.len(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use uuid::Uuid;
    use zip::write::SimpleFileOptions;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("egressos-registry-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn hasher() -> IdentityHasher {
        IdentityHasher::new("registry-test-salt").unwrap()
    }

    fn normalizer(mode: JoinKeyMode) -> Normalizer {
        Normalizer::new(hasher(), mode, 0.05)
    }

    /// One partner row in the published layout.
    fn row(partner_type: &str, name: &str, identifier: &str) -> String {
        format!(
            "\"12345678\";\"{partner_type}\";\"{name}\";\"{identifier}\";\"49\";\"20200115\";\"\";\"***000000**\";\"\";\"00\";\"4\"\n"
        )
    }

    /// Partner dumps are published in ISO-8859-1.
    fn latin1(text: &str) -> Vec<u8> {
        text.chars()
            .map(|c| u8::try_from(u32::from(c)).expect("latin-1 char"))
            .collect()
    }

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn deduplicates_first_seen_in_archive_order() {
        let tmp = temp_dir();
        // Socios1 is written first but must be processed second.
        let second = tmp.join("Socios1.zip");
        let first = tmp.join("Socios0.zip");
        write_zip(
            &second,
            &[("S1.SOCIOCSV", row("2", "SEGUNDO NOME", "***982247**").as_bytes())],
        );
        let content = [
            row("2", "Maria  da Conceição", "***982247**"),
            row("2", "Joao Silva", "***444777**"),
            row("1", "EMPRESA LTDA", "11222333000181"),
            row("3", "FOREIGNER", "***123456**"),
            row("2", "SHORT ID", "***12**"),
        ]
        .concat();
        write_zip(&first, &[("S0.SOCIOCSV", latin1(&content).as_slice())]);

        let n = normalizer(JoinKeyMode::MaskedCpf);
        let registry = n.normalize(&[second, first]).unwrap();

        assert_eq!(registry.stats.rows_read, 6);
        assert_eq!(registry.stats.malformed_rows, 0);
        assert_eq!(registry.stats.distinct_ids, 2);
        assert_eq!(registry.socios.len(), 2);
        assert_eq!(registry.archives[0].name, "Socios0.zip");

        let h = hasher();
        let maria = h.hash("982247");
        assert!(registry.socios.contains(&maria));
        assert!(registry.socios.contains(&h.hash("444777")));
        assert_eq!(registry.names[&maria], "MARIA DA CONCEICAO");

        let mut sorted = registry.socios.clone();
        sorted.sort();
        assert_eq!(sorted, registry.socios);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn latin1_names_are_decoded() {
        let tmp = temp_dir();
        let path = tmp.join("Socios0.zip");
        let mut content = b"\"1\";\"2\";\"JOS\xc9 AUGUSTO\";\"***982247**\";\"49\";\"\";\"\";\"\";\"\";\"\";\"\"\n".to_vec();
        content.extend_from_slice(b"\"1\";\"2\";\"ANA\";\"***444777**\";\"49\";\"\";\"\";\"\";\"\";\"\";\"\"\n");
        write_zip(&path, &[("S0.SOCIOCSV", content.as_slice())]);

        let registry = normalizer(JoinKeyMode::MaskedCpf).normalize(&[path]).unwrap();
        let names: Vec<&str> = registry.names.values().map(String::as_str).collect();
        assert!(names.contains(&"JOSE AUGUSTO"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn directories_inside_archives_are_skipped() {
        let tmp = temp_dir();
        let path = tmp.join("Socios0.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.add_directory("nested/", SimpleFileOptions::default()).unwrap();
        zip.start_file("nested/S0.SOCIOCSV", SimpleFileOptions::default()).unwrap();
        zip.write_all(row("2", "ANA", "***982247**").as_bytes()).unwrap();
        zip.finish().unwrap();

        let registry = normalizer(JoinKeyMode::MaskedCpf).normalize(&[path]).unwrap();
        assert_eq!(registry.stats.rows_read, 1);
        assert_eq!(registry.stats.distinct_ids, 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn malformed_ratio_above_threshold_fails() {
        let tmp = temp_dir();
        let path = tmp.join("Socios0.zip");
        let content = [
            row("2", "ANA", "***982247**"),
            "\"only\";\"three\";\"fields\"\n".to_string(),
            row("7", "BAD TYPE", "***444777**"),
            row("2", "BIA", "***444777**"),
        ]
        .concat();
        write_zip(&path, &[("S0.SOCIOCSV", content.as_bytes())]);

        let err = normalizer(JoinKeyMode::MaskedCpf).normalize(&[path]).unwrap_err();
        match err {
            EgressosError::DataQuality { malformed, total, .. } => {
                assert_eq!(malformed, 2);
                assert_eq!(total, 4);
            }
            other => panic!("expected DataQuality, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn malformed_rows_within_threshold_are_skipped() {
        let tmp = temp_dir();
        let path = tmp.join("Socios0.zip");
        let mut content: String = (0..29).map(|_| row("2", "ANA", "***982247**")).collect();
        content.push_str("\"broken\"\n");
        write_zip(&path, &[("S0.SOCIOCSV", content.as_bytes())]);

        let registry = normalizer(JoinKeyMode::MaskedCpf).normalize(&[path]).unwrap();
        assert_eq!(registry.stats.rows_read, 30);
        assert_eq!(registry.stats.malformed_rows, 1);
        assert_eq!(registry.stats.distinct_ids, 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn empty_input_is_not_a_quality_failure() {
        let tmp = temp_dir();
        let path = tmp.join("Socios0.zip");
        write_zip(&path, &[("S0.SOCIOCSV", &b""[..])]);

        let registry = normalizer(JoinKeyMode::MaskedCpf).normalize(&[path]).unwrap();
        assert_eq!(registry.stats.rows_read, 0);
        assert!(registry.socios.is_empty());

        let registry = normalizer(JoinKeyMode::MaskedCpf).normalize(&[]).unwrap();
        assert!(registry.socios.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn corrupt_archive_is_parse_error() {
        let tmp = temp_dir();
        let path = tmp.join("Socios0.zip");
        std::fs::write(&path, b"not a zip").unwrap();
        let err = normalizer(JoinKeyMode::MaskedCpf).normalize(&[path]).unwrap_err();
        assert!(matches!(err, EgressosError::Parse { .. }), "got {err:?}");
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn persisted_outputs_hold_no_raw_identifiers() {
        let tmp = temp_dir();
        let archive = tmp.join("Socios0.zip");
        let content = [
            row("2", "ANA", "52998224725"),
            row("2", "BIA", "11144477735"),
        ]
        .concat();
        write_zip(&archive, &[("S0.SOCIOCSV", content.as_bytes())]);

        let out = tmp.join("silver");
        let registry = normalizer(JoinKeyMode::Full).normalize(&[archive]).unwrap();
        let manifest = persist(&registry, &out, None).unwrap();
        assert_eq!(manifest.distinct_ids, 2);
        assert_eq!(manifest.join_key, JoinKeyMode::Full);

        for file in [SOCIOS_FILE, SOCIOS_NAMES_FILE, MANIFEST_FILE] {
            let bytes = std::fs::read(out.join(file)).unwrap();
            let text = String::from_utf8_lossy(&bytes);
            assert!(!text.contains("52998224725"), "{file} leaks an identifier");
            assert!(!text.contains("11144477735"), "{file} leaks an identifier");
        }

        let batches = egressos_storage::read_parquet(&out.join(SOCIOS_FILE)).unwrap();
        let ids = egressos_storage::collect_strings(&batches, schema::ID_HASH).unwrap();
        assert!(ids.contains(&hasher().hash("52998224725").into_string()));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn prepare_reuses_unchanged_inputs() {
        let tmp = temp_dir();
        let archive = tmp.join("Socios0.zip");
        write_zip(&archive, &[("S0.SOCIOCSV", row("2", "ANA", "***982247**").as_bytes())]);
        let out = tmp.join("silver");
        let archives = vec![archive.clone()];
        let n = normalizer(JoinKeyMode::MaskedCpf);

        let first = prepare(&n, &archives, &out, None, false).unwrap();
        assert!(!first.reused);

        let second = prepare(&n, &archives, &out, None, false).unwrap();
        assert!(second.reused);
        assert_eq!(second.manifest.distinct_ids, 1);

        let forced = prepare(&n, &archives, &out, None, true).unwrap();
        assert!(!forced.reused);

        let other_salt = Normalizer::new(
            IdentityHasher::new("rotated-salt").unwrap(),
            JoinKeyMode::MaskedCpf,
            0.05,
        );
        assert!(!prepare(&other_salt, &archives, &out, None, false).unwrap().reused);

        write_zip(
            &archive,
            &[("S0.SOCIOCSV", [row("2", "ANA", "***982247**"), row("2", "BIA", "***444777**")].concat().as_bytes())],
        );
        let changed = prepare(&other_salt, &archives, &out, None, false).unwrap();
        assert!(!changed.reused);
        assert_eq!(changed.manifest.distinct_ids, 2);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn prepare_without_archives_keeps_existing_outputs() {
        let tmp = temp_dir();
        let archive = tmp.join("Socios0.zip");
        write_zip(&archive, &[("S0.SOCIOCSV", row("2", "ANA", "***982247**").as_bytes())]);
        let out = tmp.join("silver");
        let n = normalizer(JoinKeyMode::MaskedCpf);
        prepare(&n, &[archive], &out, None, false).unwrap();
        let before = std::fs::read(out.join(MANIFEST_FILE)).unwrap();

        for force in [false, true] {
            let err = prepare(&n, &[], &out, None, force).unwrap_err();
            assert!(matches!(err, EgressosError::NotFound(_)), "got {err:?}");
        }

        assert_eq!(std::fs::read(out.join(MANIFEST_FILE)).unwrap(), before);
        let batches = egressos_storage::read_parquet(&out.join(SOCIOS_FILE)).unwrap();
        assert_eq!(egressos_storage::row_count(&batches), 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn persist_replaces_all_files_together() {
        let tmp = temp_dir();
        let archive = tmp.join("Socios0.zip");
        let out = tmp.join("silver");
        let n = normalizer(JoinKeyMode::MaskedCpf);

        write_zip(
            &archive,
            &[("S0.SOCIOCSV", [row("2", "ANA", "***982247**"), row("2", "BIA", "***444777**")].concat().as_bytes())],
        );
        persist(&n.normalize(&[archive.clone()]).unwrap(), &out, None).unwrap();
        std::fs::write(out.join("stray.tmp"), b"left over").unwrap();

        write_zip(&archive, &[("S0.SOCIOCSV", row("2", "ANA", "***982247**").as_bytes())]);
        let manifest = persist(&n.normalize(&[archive]).unwrap(), &out, None).unwrap();

        let ids = egressos_storage::read_parquet(&out.join(SOCIOS_FILE)).unwrap();
        let names = egressos_storage::read_parquet(&out.join(SOCIOS_NAMES_FILE)).unwrap();
        assert_eq!(egressos_storage::row_count(&ids), manifest.distinct_ids);
        assert_eq!(egressos_storage::row_count(&names), 1);
        assert_eq!(load_manifest(&out).unwrap().unwrap().distinct_ids, 1);
        assert!(!out.join("stray.tmp").exists());

        let mut siblings: Vec<String> = std::fs::read_dir(&tmp)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        siblings.sort();
        assert_eq!(siblings, vec!["Socios0.zip", "silver"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn partner_archive_names() {
        assert!(is_partner_archive(Path::new("/raw/2025-09/Socios0.zip")));
        assert!(is_partner_archive(Path::new("SOCIOS9.ZIP")));
        assert!(!is_partner_archive(Path::new("Empresas0.zip")));
    }
}
