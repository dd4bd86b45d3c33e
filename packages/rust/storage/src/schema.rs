//! Arrow schemas of every persisted dataset.
//!
//! None of these schemas carries a raw identifier, a registration number or
//! a birth date. Registry names only appear in `socios_nomes`.

use std::sync::{Arc, LazyLock};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

pub const ID_HASH: &str = "id_hash";
pub const NAME: &str = "name";

pub const PERSON_ID: &str = "person_id";
pub const FOUNDER_PARTNER: &str = "founder_partner";
pub const PARTNER_BY_NAME: &str = "partner_by_name";
pub const AGE: &str = "age";
pub const AGE_BRACKET: &str = "age_bracket";
pub const COURSE: &str = "course";
pub const COURSE_CODE: &str = "course_code";
pub const LEVEL: &str = "level";
pub const COURSE_STATUS: &str = "course_status";
pub const ENTRY_DATE: &str = "entry_date";
pub const GRADUATION_DATE: &str = "graduation_date";

static SOCIOS: LazyLock<SchemaRef> =
    LazyLock::new(|| Arc::new(Schema::new(vec![Field::new(ID_HASH, DataType::Utf8, false)])));

static SOCIOS_NAMES: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new(ID_HASH, DataType::Utf8, false),
        Field::new(NAME, DataType::Utf8, false),
    ]))
});

static ENRICHED: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new(PERSON_ID, DataType::Utf8, true),
        Field::new(FOUNDER_PARTNER, DataType::Boolean, false),
        Field::new(PARTNER_BY_NAME, DataType::Boolean, false),
        Field::new(AGE, DataType::UInt32, true),
        Field::new(AGE_BRACKET, DataType::Utf8, false),
        Field::new(COURSE, DataType::Utf8, true),
        Field::new(COURSE_CODE, DataType::Utf8, true),
        Field::new(LEVEL, DataType::Utf8, true),
        Field::new(COURSE_STATUS, DataType::Utf8, true),
        Field::new(ENTRY_DATE, DataType::Date32, true),
        Field::new(GRADUATION_DATE, DataType::Date32, true),
    ]))
});

/// `socios.parquet`: one pseudonymized join key per distinct partner.
pub fn socios_schema() -> SchemaRef {
    SOCIOS.clone()
}

/// `socios_nomes.parquet`: pseudonymized join key to normalized partner name.
pub fn socios_names_schema() -> SchemaRef {
    SOCIOS_NAMES.clone()
}

/// The enriched alumni dataset.
pub fn enriched_schema() -> SchemaRef {
    ENRICHED.clone()
}
