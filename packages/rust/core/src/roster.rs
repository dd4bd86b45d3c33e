//! Alumni roster ingestion.
//!
//! Reads the institution's roster spreadsheet (XLSX, XLS, ODS, or CSV) into
//! [`AlumniRecord`]s. Header names are normalized (accents stripped, lower
//! case, spaces and hyphens as `_`) and mapped through a small alias table,
//! so `Data Nascimento`, `DataNascimento` and `data_nascimento` all land in
//! the same field.

use std::collections::HashMap;
use std::path::Path;

use calamine::{Data, Reader, open_workbook_auto};
use chrono::{Days, NaiveDate, NaiveDateTime};
use egressos_shared::{EgressosError, Result, normalize_name};
use tracing::{debug, info, instrument};

/// Excel serial day zero (accounts for the 1900 leap-year bug).
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Largest serial Excel can represent (9999-12-31).
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

const COLUMN_ALIASES: [(&str, &str); 9] = [
    ("matriculadre", "matricula"),
    ("datanascimento", "data_nascimento"),
    ("dataingresso", "data_ingresso"),
    ("dataconclusao", "data_formacao"),
    ("data_conclusao", "data_formacao"),
    ("pai", "nome_pai"),
    ("mae", "nome_mae"),
    ("codigo", "codigo_curso"),
    ("situacaocurso", "situacao_curso"),
];

const COL_IDENTIFIER: &str = "cpf";
const COL_NAME: &str = "nome";
const COL_BIRTH_DATE: &str = "data_nascimento";
const COL_AGE: &str = "idade";
const COL_REGISTRATION: &str = "matricula";
const COL_COURSE: &str = "curso";
const COL_COURSE_CODE: &str = "codigo_curso";
const COL_LEVEL: &str = "nivel";
const COL_COURSE_STATUS: &str = "situacao_curso";
const COL_ENTRY_DATE: &str = "data_ingresso";
const COL_GRADUATION_DATE: &str = "data_formacao";

// ---------------------------------------------------------------------------
// AlumniRecord
// ---------------------------------------------------------------------------

/// One roster row. Holds personal data; never persisted as is.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AlumniRecord {
    /// Raw personal identifier (CPF) as written in the roster.
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    /// Explicit age column, used when the birth date is missing.
    pub age: Option<u32>,
    pub registration: Option<String>,
    pub course: Option<String>,
    pub course_code: Option<String>,
    pub level: Option<String>,
    pub course_status: Option<String>,
    pub entry_date: Option<NaiveDate>,
    pub graduation_date: Option<NaiveDate>,
}

impl std::fmt::Debug for AlumniRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AlumniRecord")
            .field("identifier", &redact(&self.identifier))
            .field("name", &redact(&self.name))
            .field("birth_date", &self.birth_date.map(|_| "<redacted>"))
            .field("age", &self.age)
            .field("registration", &redact(&self.registration))
            .field("course", &self.course)
            .field("course_code", &self.course_code)
            .field("level", &self.level)
            .field("course_status", &self.course_status)
            .field("entry_date", &self.entry_date)
            .field("graduation_date", &self.graduation_date)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// A spreadsheet cell reduced to what the roster needs.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Cell {
    fn text(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Text(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{n:.0}")),
            Self::Number(n) => Some(n.to_string()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Empty => None,
            Self::Date(d) => Some(*d),
            Self::Number(n) => excel_serial_to_date(*n),
            Self::Text(s) => parse_date(s),
        }
    }

    fn age(&self) -> Option<u32> {
        match self {
            Self::Number(n) if n.is_finite() && *n >= 0.0 && *n < 150.0 => Some(n.trunc() as u32),
            Self::Text(s) => {
                let s = s.trim().replace(',', ".");
                s.parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite() && *n >= 0.0 && *n < 150.0)
                    .map(|n| n.trunc() as u32)
            }
            _ => None,
        }
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty | Data::Error(_) => Self::Empty,
            Data::String(s) => Self::Text(s.clone()),
            Data::Int(i) => Self::Number(*i as f64),
            Data::Float(f) => Self::Number(*f),
            Data::Bool(b) => Self::Text(b.to_string()),
            Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()).map_or(Self::Empty, Self::Date),
            Data::DateTimeIso(s) => parse_date(s).map_or_else(|| Self::Text(s.clone()), Self::Date),
            Data::DurationIso(s) => Self::Text(s.clone()),
        }
    }
}

/// Convert an Excel serial day number to a date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > MAX_EXCEL_SERIAL {
        return None;
    }
    let (y, m, d) = EXCEL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Parse the date notations found in rosters: `dd/mm/yyyy`, `yyyy-mm-dd`,
/// `dd-mm-yyyy` (optionally followed by a time), or an Excel serial.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    const DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%Y/%m/%d"];
    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| s.parse::<f64>().ok().and_then(excel_serial_to_date))
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Canonical column key for a raw header.
pub fn normalize_header(raw: &str) -> String {
    let key = normalize_name(raw)
        .to_lowercase()
        .replace([' ', '-'], "_");
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or(key)
}

/// Column positions of the fields the pipeline uses.
#[derive(Debug)]
struct ColumnMap {
    positions: HashMap<String, usize>,
}

impl ColumnMap {
    fn from_headers(headers: &[String]) -> Result<Self> {
        let mut positions = HashMap::new();
        for (idx, raw) in headers.iter().enumerate() {
            let key = normalize_header(raw);
            if key.is_empty() {
                continue;
            }
            if positions.insert(key.clone(), idx).is_some() {
                return Err(EgressosError::schema(format!(
                    "roster has more than one '{key}' column"
                )));
            }
        }

        if !positions.contains_key(COL_IDENTIFIER) {
            return Err(EgressosError::schema(format!(
                "roster has no '{COL_IDENTIFIER}' column (found: {})",
                sorted_keys(&positions)
            )));
        }
        if !positions.contains_key(COL_BIRTH_DATE) && !positions.contains_key(COL_AGE) {
            return Err(EgressosError::schema(format!(
                "roster needs a '{COL_BIRTH_DATE}' or '{COL_AGE}' column (found: {})",
                sorted_keys(&positions)
            )));
        }
        Ok(Self { positions })
    }

    fn cell<'a>(&self, row: &'a [Cell], key: &str) -> &'a Cell {
        self.positions
            .get(key)
            .and_then(|&idx| row.get(idx))
            .unwrap_or(&Cell::Empty)
    }

    fn record(&self, row: &[Cell]) -> AlumniRecord {
        AlumniRecord {
            identifier: self.cell(row, COL_IDENTIFIER).text(),
            name: self.cell(row, COL_NAME).text(),
            birth_date: self.cell(row, COL_BIRTH_DATE).date(),
            age: self.cell(row, COL_AGE).age(),
            registration: self.cell(row, COL_REGISTRATION).text(),
            course: self.cell(row, COL_COURSE).text(),
            course_code: self.cell(row, COL_COURSE_CODE).text(),
            level: self.cell(row, COL_LEVEL).text(),
            course_status: self.cell(row, COL_COURSE_STATUS).text(),
            entry_date: self.cell(row, COL_ENTRY_DATE).date(),
            graduation_date: self.cell(row, COL_GRADUATION_DATE).date(),
        }
    }
}

fn sorted_keys(positions: &HashMap<String, usize>) -> String {
    let mut keys: Vec<&str> = positions.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys.join(", ")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load the roster at `path`. The format is chosen by file extension.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_roster(path: &Path) -> Result<Vec<AlumniRecord>> {
    if !path.is_file() {
        return Err(EgressosError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "roster file not found"),
        ));
    }

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let rows = match extension.as_str() {
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => read_workbook(path)?,
        "csv" | "txt" => read_csv(path)?,
        other => {
            return Err(EgressosError::validation(format!(
                "unsupported roster format '.{other}' (expected xlsx, xls, ods or csv)"
            )));
        }
    };

    let mut rows = rows.into_iter();
    let headers: Vec<String> = rows
        .next()
        .ok_or_else(|| EgressosError::schema("roster is empty (no header row)"))?
        .iter()
        .map(|c| c.text().unwrap_or_default())
        .collect();
    let columns = ColumnMap::from_headers(&headers)?;

    let records: Vec<AlumniRecord> = rows
        .filter(|row| row.iter().any(|c| c.text().is_some()))
        .map(|row| columns.record(&row))
        .collect();

    info!(records = records.len(), columns = headers.len(), "roster loaded");
    Ok(records)
}

fn read_workbook(path: &Path) -> Result<Vec<Vec<Cell>>> {
    let mut workbook = open_workbook_auto(path).map_err(|e| {
        EgressosError::parse(format!("cannot open workbook {}: {e}", path.display()))
    })?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| EgressosError::schema("workbook has no worksheet"))?
        .map_err(|e| EgressosError::parse(format!("cannot read first worksheet: {e}")))?;

    debug!(rows = range.height(), cols = range.width(), "worksheet read");
    Ok(range
        .rows()
        .map(|row| row.iter().map(Cell::from).collect())
        .collect())
}

fn read_csv(path: &Path) -> Result<Vec<Vec<Cell>>> {
    let bytes = std::fs::read(path).map_err(|e| EgressosError::io(path, e))?;
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);

    // Spreadsheet exports are often Windows-1252/Latin-1 rather than UTF-8.
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    };

    let header_line = text.lines().next().unwrap_or_default();
    let delimiter = if header_line.matches(';').count() > header_line.matches(',').count() {
        b';'
    } else {
        b','
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    reader
        .records()
        .map(|record| {
            record
                .map(|r| r.iter().map(|f| Cell::Text(f.to_string())).collect())
                .map_err(|e| EgressosError::parse(format!("{}: {e}", path.display())))
        })
        .collect()
}
