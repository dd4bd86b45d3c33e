//! Reading partner rows out of the registry ZIP archives.
//!
//! Each archive holds one or more header-less, `;`-delimited, `"`-quoted
//! Latin-1 text files with 11 columns per row.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use csv::{ByteRecord, ReaderBuilder};
use egressos_shared::{EgressosError, Result};
use tracing::debug;

/// Number of columns in the partner layout.
pub const PARTNER_COLUMNS: usize = 11;

const COL_CNPJ_BASICO: usize = 0;
const COL_PARTNER_TYPE: usize = 1;
const COL_NAME: usize = 2;
const COL_IDENTIFIER: usize = 3;
const COL_QUALIFICATION: usize = 4;

/// `identificador_socio` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerType {
    /// `1`
    LegalEntity,
    /// `2`
    NaturalPerson,
    /// `3`
    Foreigner,
}

impl PartnerType {
    fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(Self::LegalEntity),
            "2" => Some(Self::NaturalPerson),
            "3" => Some(Self::Foreigner),
            _ => None,
        }
    }
}

/// One partner row. Only lives while an archive is being read.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub cnpj_basico: String,
    pub partner_type: PartnerType,
    pub name: String,
    /// Raw identifier as published (masked CPF or CNPJ).
    pub identifier: String,
    pub qualification: String,
}

impl std::fmt::Debug for RegistryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryRecord")
            .field("cnpj_basico", &self.cnpj_basico)
            .field("partner_type", &self.partner_type)
            .field("name", &"<redacted>")
            .field("identifier", &"<redacted>")
            .field("qualification", &self.qualification)
            .finish()
    }
}

/// Outcome of reading one physical row.
#[derive(Debug)]
pub enum Row {
    Valid(RegistryRecord),
    Malformed,
}

/// Decode Latin-1 bytes. Every byte maps to the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn field(record: &ByteRecord, idx: usize) -> String {
    record.get(idx).map(decode_latin1).unwrap_or_default()
}

/// Classify a parsed row.
pub fn parse_row(record: &ByteRecord) -> Row {
    if record.len() < PARTNER_COLUMNS {
        return Row::Malformed;
    }
    let Some(partner_type) = PartnerType::from_code(&field(record, COL_PARTNER_TYPE)) else {
        return Row::Malformed;
    };
    Row::Valid(RegistryRecord {
        cnpj_basico: field(record, COL_CNPJ_BASICO).trim().to_string(),
        partner_type,
        name: field(record, COL_NAME),
        identifier: field(record, COL_IDENTIFIER),
        qualification: field(record, COL_QUALIFICATION).trim().to_string(),
    })
}

/// Feed every row of every file inside `archive` to `on_row`, in order.
///
/// Directory entries are skipped. A CSV error on a row counts as a malformed
/// row; an I/O failure while inflating the archive aborts with `Parse`.
pub fn read_archive<F>(archive: &Path, mut on_row: F) -> Result<()>
where
    F: FnMut(Row),
{
    let file = File::open(archive).map_err(|e| EgressosError::io(archive, e))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
        EgressosError::parse(format!("{} is not a readable ZIP archive: {e}", archive.display()))
    })?;

    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(|e| {
            EgressosError::parse(format!("{}: entry {i}: {e}", archive.display()))
        })?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        debug!(archive = %archive.display(), entry = %entry_name, "reading archive entry");

        let mut reader = ReaderBuilder::new()
            .delimiter(b';')
            .quote(b'"')
            .has_headers(false)
            .flexible(true)
            .from_reader(entry);

        for result in reader.byte_records() {
            match result {
                Ok(record) => on_row(parse_row(&record)),
                Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => {
                    return Err(EgressosError::parse(format!(
                        "{}: {entry_name}: {e}",
                        archive.display()
                    )));
                }
                Err(_) => on_row(Row::Malformed),
            }
        }
    }
    Ok(())
}
