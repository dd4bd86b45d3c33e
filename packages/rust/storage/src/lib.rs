//! Columnar storage layer.
//!
//! Parquet read/write helpers over Arrow record batches, JSON manifests,
//! SHA-256 checksums and the two replacement primitives every persisted
//! output goes through:
//! - [`write_atomic`]: write a sibling temp file, then rename over the target
//! - [`replace_dir`]: swap a fully built staging directory into place

pub mod schema;

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use arrow::array::{Array, StringArray};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use egressos_shared::{EgressosError, FileChecksum, Result};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

fn storage_err(context: impl std::fmt::Display, e: impl std::fmt::Display) -> EgressosError {
    EgressosError::Storage(format!("{context}: {e}"))
}

// ---------------------------------------------------------------------------
// Atomic files
// ---------------------------------------------------------------------------

/// Hidden sibling of `path` used as a write target before renaming.
fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{tag}-{}", Uuid::now_v7()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| EgressosError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Write a file through `write` into a temp sibling, then rename it over
/// `path`. The temp file is removed if anything fails.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    ensure_parent(path)?;
    let temp = temp_sibling(path, "tmp");

    let result = (|| {
        let mut file = File::create(&temp).map_err(|e| EgressosError::io(&temp, e))?;
        write(&mut file)?;
        file.sync_all().map_err(|e| EgressosError::io(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| EgressosError::io(path, e))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| storage_err(format!("serialize {}", path.display()), e))?;
    write_atomic(path, |file| {
        file.write_all(&json).map_err(|e| EgressosError::io(path, e))
    })
}

/// Read a JSON document. Returns `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EgressosError::io(path, e)),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| EgressosError::parse(format!("invalid JSON in {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

/// Write `batches` to a Parquet file at `path` atomically. Returns the row count.
pub fn write_parquet(path: &Path, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<usize> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut rows = 0;

    write_atomic(path, |file| {
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
            .map_err(|e| storage_err(format!("open writer for {}", path.display()), e))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| storage_err(format!("write {}", path.display()), e))?;
            rows += batch.num_rows();
        }
        writer
            .close()
            .map_err(|e| storage_err(format!("finalize {}", path.display()), e))?;
        Ok(())
    })?;

    debug!(path = %path.display(), rows, "parquet written");
    Ok(rows)
}

/// Read every record batch of a Parquet file.
pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).map_err(|e| EgressosError::io(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|e| storage_err(format!("open {}", path.display()), e))?;

    reader
        .map(|batch| batch.map_err(|e| storage_err(format!("read {}", path.display()), e)))
        .collect()
}

/// Downcast a named column to a string array.
pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| EgressosError::schema(format!("missing or non-string column '{name}'")))
}

/// All non-null values of a string column across batches.
pub fn collect_strings(batches: &[RecordBatch], name: &str) -> Result<Vec<String>> {
    let mut values = Vec::new();
    for batch in batches {
        let col = string_column(batch, name)?;
        values.extend(
            (0..col.len())
                .filter(|&i| col.is_valid(i))
                .map(|i| col.value(i).to_string()),
        );
    }
    Ok(values)
}

/// Total rows across batches.
pub fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// SHA-256 of a file, recorded with its path relative to `root`.
pub fn checksum(root: &Path, path: &Path) -> Result<FileChecksum> {
    let file = File::open(path).map_err(|e| EgressosError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size_bytes = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| EgressosError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size_bytes += n as u64;
    }

    let relative = path.strip_prefix(root).unwrap_or(path);
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    Ok(FileChecksum {
        path: relative,
        sha256: format!("{:x}", hasher.finalize()),
        size_bytes,
    })
}

// ---------------------------------------------------------------------------
// Directory replacement
// ---------------------------------------------------------------------------

/// Create an empty staging directory next to `target`.
pub fn create_staging_dir(target: &Path) -> Result<PathBuf> {
    ensure_parent(target)?;
    let staging = temp_sibling(target, "staging");
    std::fs::create_dir_all(&staging).map_err(|e| EgressosError::io(&staging, e))?;
    Ok(staging)
}

/// Swap `staging` into `target`.
///
/// An existing `target` is renamed aside first and only removed once the new
/// tree is in place; if the swap fails it is restored.
pub fn replace_dir(staging: &Path, target: &Path) -> Result<()> {
    let previous = if target.exists() {
        let aside = temp_sibling(target, "old");
        std::fs::rename(target, &aside).map_err(|e| EgressosError::io(target, e))?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(staging, target) {
        if let Some(aside) = &previous {
            let _ = std::fs::rename(aside, target);
        }
        return Err(EgressosError::io(target, e));
    }

    if let Some(aside) = previous {
        if let Err(e) = std::fs::remove_dir_all(&aside) {
            tracing::warn!(path = %aside.display(), error = %e, "failed to remove previous output");
        }
    }
    Ok(())
}
