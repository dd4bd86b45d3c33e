//! Partitioned writer for the enriched dataset.
//!
//! Layout under `<output_root>/<dataset>/`:
//!
//! ```text
//! <dataset>.parquet
//! partition_age_bracket/age_bracket=<bracket>/part-0.parquet
//! _manifest.json
//! ```
//!
//! The whole tree is built in a staging sibling and swapped in at the end,
//! so a failed run leaves the previous output untouched and stale
//! partitions never survive a successful one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Date32Array, StringArray, UInt32Array};
use arrow::datatypes::Date32Type;
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, Utc};
use egressos_shared::{CURRENT_SCHEMA_VERSION, EgressosError, OutputManifest, Result};
use egressos_storage::schema;
use tracing::{debug, info, instrument};

use crate::enrichment::EnrichedAlumniRecord;

/// Directory holding the per-bracket partitions.
pub const PARTITION_DIR: &str = "partition_age_bracket";
/// Output manifest file name.
pub const MANIFEST_FILE: &str = "_manifest.json";
/// File name of each partition.
const PART_FILE: &str = "part-0.parquet";

/// Summary of a write.
#[derive(Debug, Clone)]
pub struct WriteReport {
    /// `<output_root>/<dataset>`.
    pub dataset_dir: PathBuf,
    pub records: usize,
    /// Row count per bracket label.
    pub partitions: BTreeMap<String, usize>,
    pub manifest: OutputManifest,
}

/// Directory name of a bracket partition.
pub fn partition_dir_name(bracket: &str) -> String {
    format!("age_bracket={}", bracket.replace(['/', '\\'], "-"))
}

fn to_date32(date: Option<NaiveDate>) -> Option<i32> {
    date.map(Date32Type::from_naive_date)
}

/// Convert records to a batch in the enriched schema.
pub fn to_record_batch(records: &[&EnrichedAlumniRecord]) -> Result<RecordBatch> {
    let strings = |f: fn(&EnrichedAlumniRecord) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(records.iter().map(|r| f(r)).collect::<Vec<_>>()))
    };

    let columns: Vec<ArrayRef> = vec![
        strings(|r| r.person_id.as_ref().map(|p| p.as_str())),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.founder_partner).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.partner_by_name).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            records.iter().map(|r| r.age).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.age_bracket.as_str()).collect::<Vec<_>>(),
        )),
        strings(|r| r.course.as_deref()),
        strings(|r| r.course_code.as_deref()),
        strings(|r| r.level.as_deref()),
        strings(|r| r.course_status.as_deref()),
        Arc::new(Date32Array::from(
            records.iter().map(|r| to_date32(r.entry_date)).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            records.iter().map(|r| to_date32(r.graduation_date)).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema::enriched_schema(), columns)
        .map_err(|e| EgressosError::Storage(format!("build enriched batch: {e}")))
}

/// Write the consolidated file, the partitions and the manifest, then swap
/// the tree into `<output_root>/<dataset>`.
#[instrument(skip_all, fields(records = records.len(), dataset = %dataset))]
pub fn write(
    records: &[EnrichedAlumniRecord],
    output_root: &Path,
    dataset: &str,
    degraded: bool,
) -> Result<WriteReport> {
    let dataset_dir = output_root.join(dataset);
    let staging = egressos_storage::create_staging_dir(&dataset_dir)?;

    let result = build_tree(records, &staging, dataset, degraded);
    let (partitions, manifest) = match result {
        Ok(built) => built,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    if let Err(e) = egressos_storage::replace_dir(&staging, &dataset_dir) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    info!(
        path = %dataset_dir.display(),
        records = records.len(),
        partitions = partitions.len(),
        "enriched dataset written"
    );

    Ok(WriteReport {
        dataset_dir,
        records: records.len(),
        partitions,
        manifest,
    })
}

fn build_tree(
    records: &[EnrichedAlumniRecord],
    root: &Path,
    dataset: &str,
    degraded: bool,
) -> Result<(BTreeMap<String, usize>, OutputManifest)> {
    let schema = schema::enriched_schema();
    let mut files = Vec::new();

    let all: Vec<&EnrichedAlumniRecord> = records.iter().collect();
    let consolidated = root.join(format!("{dataset}.parquet"));
    egressos_storage::write_parquet(&consolidated, &schema, &[to_record_batch(&all)?])?;
    files.push(egressos_storage::checksum(root, &consolidated)?);

    let mut groups: BTreeMap<&str, Vec<&EnrichedAlumniRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.age_bracket.as_str()).or_default().push(record);
    }

    let mut partitions = BTreeMap::new();
    for (bracket, rows) in &groups {
        let path = root
            .join(PARTITION_DIR)
            .join(partition_dir_name(bracket))
            .join(PART_FILE);
        egressos_storage::write_parquet(&path, &schema, &[to_record_batch(rows)?])?;
        files.push(egressos_storage::checksum(root, &path)?);
        partitions.insert((*bracket).to_string(), rows.len());
        debug!(bracket, rows = rows.len(), "partition written");
    }

    let manifest = OutputManifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        dataset: dataset.to_string(),
        record_count: records.len(),
        founder_count: records.iter().filter(|r| r.founder_partner).count(),
        name_match_count: records.iter().filter(|r| r.partner_by_name).count(),
        degraded,
        brackets: partitions.clone(),
        files,
        generated_at: Utc::now(),
    };
    egressos_storage::write_json(&root.join(MANIFEST_FILE), &manifest)?;

    Ok((partitions, manifest))
}
