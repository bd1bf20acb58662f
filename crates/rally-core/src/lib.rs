//! Core domain model for the rally map enrichment job.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

mod states;

pub use states::{expand_state, STATES};

pub const CRATE_NAME: &str = "rally-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Event,
    Turnout,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Event => "event",
            RecordKind::Turnout => "turnout",
        }
    }

    /// Human label used for defaulted names ("Unnamed Event").
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Event => "Event",
            RecordKind::Turnout => "Turnout",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One shaped input row, as handed over by the ingestion boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub sheet: String,
    pub row_index: usize,
    pub kind: Option<RecordKind>,
    pub date: String,
    pub name: String,
    pub address: String,
    pub zip: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub link: String,
    pub turnout_low: String,
    pub turnout_high: String,
    pub coverage_url: String,
    /// Columns the schema does not recognize, passed through untouched.
    pub extensions: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn kind(&self) -> RecordKind {
        self.kind.unwrap_or(RecordKind::Event)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
}

impl Address {
    pub fn new(
        address: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        zip: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into().trim().to_string(),
            city: city.into().trim().to_string(),
            state: state.into().trim().to_string(),
            zip: zip.into().trim().to_string(),
            country: country.into().trim().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        [&self.address, &self.zip, &self.city, &self.state, &self.country]
            .iter()
            .all(|f| f.trim().is_empty())
    }

    pub fn key(&self) -> AddressKey {
        AddressKey::from_address(self)
    }
}

/// Lower-cased, trimmed, pipe-joined non-empty fields in the order
/// address, zip, city, state, country.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressKey(String);

impl AddressKey {
    pub fn from_address(address: &Address) -> Self {
        let key = [
            &address.address,
            &address.zip,
            &address.city,
            &address.state,
            &address.country,
        ]
        .iter()
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join("|");
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
}

/// `"{city}-{state}"`, lower-cased, whitespace collapsed, state expanded to
/// its full name when it is a known abbreviation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CityKey(String);

impl CityKey {
    pub fn new(city: &str, state: &str) -> Self {
        let state = expand_state(state);
        Self(format!(
            "{}-{}",
            collapse_whitespace(city).to_lowercase(),
            collapse_whitespace(&state).to_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityInfo {
    pub article_url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub i64);

/// Fully resolved location. Only built once both the address and the city
/// resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
    pub city: String,
    pub state: String,
    pub city_info: CityInfo,
    pub voting_lean: Option<f64>,
}

/// A record after sanitizing: canonical date, defaulted name, cleared bad fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub sheet: String,
    pub row_index: usize,
    pub kind: RecordKind,
    pub date: NaiveDate,
    pub name: String,
    pub address: Address,
    pub link: Option<String>,
    pub coverage_url: Option<String>,
    pub turnout_low: Option<u64>,
    pub turnout_high: Option<u64>,
    pub extensions: BTreeMap<String, String>,
}

impl CleanRecord {
    pub fn canonical_date(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub record: CleanRecord,
    pub location: LocationInfo,
    pub regions: Vec<RegionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    HardReject,
    SoftWarn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    MalformedRow,
    BadDate,
    BadAddress,
    BadCity,
    BadZipcode,
    BadLink,
    MissingName,
    BadTurnout,
}

impl IssueCategory {
    pub fn severity(&self) -> Severity {
        match self {
            IssueCategory::MalformedRow
            | IssueCategory::BadDate
            | IssueCategory::BadAddress
            | IssueCategory::BadCity => Severity::HardReject,
            IssueCategory::BadZipcode
            | IssueCategory::BadLink
            | IssueCategory::MissingName
            | IssueCategory::BadTurnout => Severity::SoftWarn,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IssueCategory::MalformedRow => "Malformed row",
            IssueCategory::BadDate => "Bad date",
            IssueCategory::BadAddress => "Bad address",
            IssueCategory::BadCity => "Bad city",
            IssueCategory::BadZipcode => "Bad zipcode",
            IssueCategory::BadLink => "Bad link",
            IssueCategory::MissingName => "Missing name",
            IssueCategory::BadTurnout => "Bad turnout",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub sheet: String,
    pub row_index: usize,
    pub category: IssueCategory,
    pub reason: String,
}

impl Issue {
    pub fn new(
        sheet: impl Into<String>,
        row_index: usize,
        category: IssueCategory,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            sheet: sheet.into(),
            row_index,
            category,
            reason: reason.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.category.severity()
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
