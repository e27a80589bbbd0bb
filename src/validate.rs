//! CSV batch upload validation.
//!
//! An upload is all-or-nothing: every row is checked, every problem is
//! reported, and nothing is written unless the whole file is clean.

use crate::db::{self, Pool};
use crate::model::{ItemAction, NewItem};
use anyhow::Result;
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashSet;
use std::fmt;
use tracing::{info, instrument};

pub const REQUIRED_COLUMNS: [&str; 6] = [
    "mid",
    "start_date",
    "end_date",
    "merchant_slug",
    "provider_slug",
    "action",
];

pub const ACCEPTED_PROVIDERS: &[&str] = &["amex"];

const INPUT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Everything wrong with an upload. File-level problems have no key; row
/// problems are keyed by the row's raw `mid`, in upload order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    file: Vec<String>,
    rows: Vec<(String, Vec<String>)>,
}

impl ValidationErrors {
    fn file(message: impl Into<String>) -> Self {
        Self {
            file: vec![message.into()],
            rows: Vec::new(),
        }
    }

    fn push(&mut self, mid: &str, message: String) {
        match self.rows.iter_mut().find(|(key, _)| key == mid) {
            Some((_, messages)) => messages.push(message),
            None => self.rows.push((mid.to_string(), vec![message])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty() && self.rows.is_empty()
    }

    pub fn file_errors(&self) -> &[String] {
        &self.file
    }

    pub fn row_errors(&self) -> &[(String, Vec<String>)] {
        &self.rows
    }

    /// Messages recorded for one mid.
    pub fn for_mid(&self, mid: &str) -> &[String] {
        self.rows
            .iter()
            .find(|(key, _)| key == mid)
            .map(|(_, messages)| messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.file.len() + self.rows.iter().map(|(_, m)| m.len()).sum::<usize>()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.file {
            writeln!(f, "{}", message)?;
        }
        for (mid, messages) in &self.rows {
            for message in messages {
                writeln!(f, "{}: {}", mid, message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported { batch_id: i64, rows: usize },
    Rejected(ValidationErrors),
}

fn headers_error() -> ValidationErrors {
    ValidationErrors::file(format!(
        "Invalid headers. Required columns: {}",
        REQUIRED_COLUMNS.join(", ")
    ))
}

/// Column positions of the required fields, in `REQUIRED_COLUMNS` order.
struct Columns([usize; 6]);

impl Columns {
    fn from_headers(headers: &StringRecord) -> Option<Self> {
        let names: HashSet<&str> = headers.iter().collect();
        let required: HashSet<&str> = REQUIRED_COLUMNS.iter().copied().collect();
        if names != required {
            return None;
        }
        let mut positions = [0; 6];
        for (slot, name) in positions.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers.iter().position(|h| h == name)?;
        }
        Some(Self(positions))
    }

    fn get<'r>(&self, record: &'r StringRecord, field: &str) -> Option<&'r str> {
        let idx = REQUIRED_COLUMNS.iter().position(|c| *c == field)?;
        record.get(self.0[idx])
    }
}

fn parse_action(raw: &str) -> Option<ItemAction> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "a" => Some(ItemAction::Add),
        "d" => Some(ItemAction::Delete),
        _ => None,
    }
}

fn parse_date(
    errors: &mut ValidationErrors,
    mid: &str,
    field: &str,
    raw: &str,
) -> Option<NaiveDate> {
    let value = raw.trim();
    match NaiveDate::parse_from_str(value, INPUT_DATE_FORMAT) {
        Ok(date) => Some(date),
        Err(_) => {
            let shown = if value.is_empty() { "<empty>" } else { value };
            errors.push(mid, format!("Invalid {}: {}", field, shown));
            None
        }
    }
}

/// Check one data row, recording problems under its raw mid.
fn validate_row(
    columns: &Columns,
    record: &StringRecord,
    errors: &mut ValidationErrors,
) -> Option<NewItem> {
    let raw_mid = columns.get(record, "mid").unwrap_or_default();
    let mut values = [""; 6];
    for (slot, field) in values.iter_mut().zip(REQUIRED_COLUMNS) {
        match columns.get(record, field) {
            Some(value) => *slot = value,
            None => {
                errors.push(raw_mid, "Missing row values".to_string());
                return None;
            }
        }
    }
    let [mid, start, end, merchant_slug, provider_slug, action] = values;

    for (field, value) in [
        ("mid", mid),
        ("merchant_slug", merchant_slug),
        ("provider_slug", provider_slug),
    ] {
        if value.trim().is_empty() {
            errors.push(raw_mid, format!("Missing row value for field: {}", field));
            return None;
        }
    }

    let mut ok = true;
    let provider_slug = provider_slug.trim();
    if !ACCEPTED_PROVIDERS.contains(&provider_slug) {
        errors.push(raw_mid, format!("Invalid provider: {}", provider_slug));
        ok = false;
    }

    let (action, start_date, end_date) = match parse_action(action) {
        Some(ItemAction::Add) => {
            let start_date = parse_date(errors, raw_mid, "start_date", start);
            let end_date = parse_date(errors, raw_mid, "end_date", end);
            match (start_date, end_date) {
                (Some(s), Some(e)) if s >= e => {
                    errors.push(
                        raw_mid,
                        format!("Start date ({}) >= end date ({})", start, end),
                    );
                    ok = false;
                }
                (Some(_), Some(_)) => {}
                _ => ok = false,
            }
            (ItemAction::Add, start_date, end_date)
        }
        Some(action) => (action, None, None),
        None => {
            errors.push(
                raw_mid,
                format!("Unrecognised action value: {}", action.trim()),
            );
            return None;
        }
    };

    ok.then(|| NewItem {
        mid: mid.trim().to_string(),
        action,
        start_date,
        end_date,
        merchant_slug: merchant_slug.trim().to_string(),
        provider_slug: provider_slug.to_string(),
    })
}

/// Parse and validate an uploaded file into rows ready to persist.
pub fn validate_upload(file_name: &str, bytes: &[u8]) -> Result<Vec<NewItem>, ValidationErrors> {
    let is_csv = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if !is_csv {
        return Err(ValidationErrors::file("Upload .csv files only"));
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ValidationErrors::file("Invalid file format"))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers().map_err(|_| headers_error())?.clone();
    let columns = Columns::from_headers(&headers).ok_or_else(headers_error)?;

    let mut errors = ValidationErrors::default();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|_| ValidationErrors::file("Invalid file format"))?;
        if let Some(row) = validate_row(&columns, &record, &mut errors) {
            rows.push(row);
        }
    }

    if errors.is_empty() {
        Ok(rows)
    } else {
        Err(errors)
    }
}

/// Validate an upload and, when it is clean, persist it as a new batch.
#[instrument(skip_all, fields(file_name = %file_name))]
pub async fn import_batch(pool: &Pool, file_name: &str, bytes: &[u8]) -> Result<ImportOutcome> {
    let rows = match validate_upload(file_name, bytes) {
        Ok(rows) => rows,
        Err(errors) => {
            info!(errors = errors.len(), "upload rejected");
            return Ok(ImportOutcome::Rejected(errors));
        }
    };
    let batch_id = db::create_batch_with_items(pool, file_name, &rows).await?;
    info!(batch_id, rows = rows.len(), "batch imported");
    Ok(ImportOutcome::Imported {
        batch_id,
        rows: rows.len(),
    })
}
