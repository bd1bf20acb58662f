//! Ingestion boundary: row sources and the strict row schema.
//!
//! Source sheets name their columns loosely ("Event Name", "Zip Code",
//! "Low Estimate"). Rows are mapped onto [`RawRecord`] here; anything the
//! schema does not know lands in `RawRecord::extensions` instead of leaking
//! arbitrary keys further down the pipeline.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rally_core::{RawRecord, RecordKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "rally-ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Date,
    Name,
    Address,
    Zip,
    City,
    State,
    Country,
    Link,
    TurnoutLow,
    TurnoutHigh,
    CoverageUrl,
}

const COLUMN_ALIASES: &[(&str, Column)] = &[
    ("date", Column::Date),
    ("event date", Column::Date),
    ("name", Column::Name),
    ("event name", Column::Name),
    ("title", Column::Name),
    ("event title", Column::Name),
    ("address", Column::Address),
    ("street address", Column::Address),
    ("street", Column::Address),
    ("location", Column::Address),
    ("zip", Column::Zip),
    ("zipcode", Column::Zip),
    ("zip code", Column::Zip),
    ("postal code", Column::Zip),
    ("city", Column::City),
    ("town", Column::City),
    ("state", Column::State),
    ("country", Column::Country),
    ("link", Column::Link),
    ("url", Column::Link),
    ("event link", Column::Link),
    ("event url", Column::Link),
    ("low", Column::TurnoutLow),
    ("turnout low", Column::TurnoutLow),
    ("low estimate", Column::TurnoutLow),
    ("high", Column::TurnoutHigh),
    ("turnout high", Column::TurnoutHigh),
    ("high estimate", Column::TurnoutHigh),
    ("coverage", Column::CoverageUrl),
    ("coverage url", Column::CoverageUrl),
    ("coverage link", Column::CoverageUrl),
    ("news coverage", Column::CoverageUrl),
];

fn normalize_header(header: &str) -> String {
    header
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn column_for(header: &str) -> Option<Column> {
    let normalized = normalize_header(header);
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, column)| *column)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowShapeError {
    #[error("row {row_index} is blank")]
    Blank { row_index: usize },
    #[error("row {row_index} has no {column} column")]
    MissingColumn {
        row_index: usize,
        column: &'static str,
    },
}

impl RowShapeError {
    pub fn row_index(&self) -> usize {
        match self {
            RowShapeError::Blank { row_index } | RowShapeError::MissingColumn { row_index, .. } => {
                *row_index
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// A sheet is a turnout sheet when any of its columns is a turnout estimate.
pub fn sniff_kind<'a>(headers: impl IntoIterator<Item = &'a str>) -> RecordKind {
    let is_turnout = headers.into_iter().any(|h| {
        matches!(
            column_for(h),
            Some(Column::TurnoutLow) | Some(Column::TurnoutHigh)
        )
    });
    if is_turnout {
        RecordKind::Turnout
    } else {
        RecordKind::Event
    }
}

/// Map one loosely-keyed row onto the strict schema.
pub fn shape_row(
    sheet: &str,
    row_index: usize,
    kind: RecordKind,
    row: &Map<String, JsonValue>,
) -> Result<RawRecord, RowShapeError> {
    let mut record = RawRecord {
        sheet: sheet.to_string(),
        row_index,
        kind: Some(kind),
        ..Default::default()
    };
    let mut saw_date = false;
    let mut any_value = false;

    for (header, value) in row {
        let text = cell_text(value);
        if !text.is_empty() {
            any_value = true;
        }
        let Some(column) = column_for(header) else {
            if !text.is_empty() {
                record.extensions.insert(header.trim().to_string(), text);
            }
            continue;
        };
        let slot = match column {
            Column::Date => {
                saw_date = true;
                &mut record.date
            }
            Column::Name => &mut record.name,
            Column::Address => &mut record.address,
            Column::Zip => &mut record.zip,
            Column::City => &mut record.city,
            Column::State => &mut record.state,
            Column::Country => &mut record.country,
            Column::Link => &mut record.link,
            Column::TurnoutLow => &mut record.turnout_low,
            Column::TurnoutHigh => &mut record.turnout_high,
            Column::CoverageUrl => &mut record.coverage_url,
        };
        // First non-empty aliased column wins.
        if slot.is_empty() {
            *slot = text;
        }
    }

    if !any_value {
        return Err(RowShapeError::Blank { row_index });
    }
    if !saw_date {
        return Err(RowShapeError::MissingColumn {
            row_index,
            column: "date",
        });
    }
    Ok(record)
}

/// Already-shaped rows of one source sheet, as exported from the sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowBundle {
    pub sheet_id: String,
    #[serde(default)]
    pub kind: Option<RecordKind>,
    pub rows: Vec<Map<String, JsonValue>>,
}

impl RowBundle {
    /// Declared kind, or the kind sniffed from the union of row headers.
    pub fn effective_kind(&self) -> RecordKind {
        self.kind.unwrap_or_else(|| {
            sniff_kind(self.rows.iter().flat_map(|r| r.keys().map(String::as_str)))
        })
    }

    pub fn shape(
        &self,
        kind_override: Option<RecordKind>,
    ) -> Vec<Result<RawRecord, RowShapeError>> {
        let kind = kind_override.unwrap_or_else(|| self.effective_kind());
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| shape_row(&self.sheet_id, idx + 1, kind, row))
            .collect()
    }
}

pub fn load_row_bundle(path: impl AsRef<Path>) -> Result<RowBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
pub trait RowSource: Send + Sync {
    fn sheet_id(&self) -> &str;

    async fn fetch_rows(&self) -> Result<Vec<Result<RawRecord, RowShapeError>>, IngestError>;
}

/// Reads a [`RowBundle`] JSON file from disk.
#[derive(Debug, Clone)]
pub struct BundleRowSource {
    sheet_id: String,
    kind: Option<RecordKind>,
    path: PathBuf,
}

impl BundleRowSource {
    pub fn new(
        sheet_id: impl Into<String>,
        kind: Option<RecordKind>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            kind,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RowSource for BundleRowSource {
    fn sheet_id(&self) -> &str {
        &self.sheet_id
    }

    async fn fetch_rows(&self) -> Result<Vec<Result<RawRecord, RowShapeError>>, IngestError> {
        let bundle = load_row_bundle(&self.path)?;
        if bundle.sheet_id != self.sheet_id {
            return Err(IngestError::Message(format!(
                "bundle sheet_id={} does not match source sheet_id={}",
                bundle.sheet_id, self.sheet_id
            )));
        }
        Ok(bundle.shape(self.kind))
    }
}

/// Count of shaped vs malformed rows, handy for logging per sheet.
pub fn shape_counts(rows: &[Result<RawRecord, RowShapeError>]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        let key = match row {
            Ok(_) => "shaped",
            Err(RowShapeError::Blank { .. }) => "blank",
            Err(RowShapeError::MissingColumn { .. }) => "missing_column",
        };
        *counts.entry(key).or_default() += 1;
    }
    counts
}
