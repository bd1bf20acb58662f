//! Row sanitizing: the first pipeline stage.
//!
//! A bad date rejects the row. Everything else (zip, links, names, turnout
//! estimates) degrades the field and records a warning.

use std::sync::OnceLock;

use chrono::NaiveDate;
use rally_core::{
    collapse_whitespace, Address, CleanRecord, Issue, IssueCategory, RawRecord, RecordKind,
};
use regex::Regex;

const PLACEHOLDER_NAMES: &[&str] = &["n/a", "na", "tbd", "tba", "unknown", "-", "?", "none"];

const TEXT_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%b %d %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%A, %B %d, %Y",
];

fn zip_pattern() -> &'static Regex {
    static ZIP: OnceLock<Regex> = OnceLock::new();
    ZIP.get_or_init(|| Regex::new(r"^\d{5}(-\d{4})?$").expect("static zip regex"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub record: CleanRecord,
    pub warnings: Vec<Issue>,
}

/// Normalize a raw row. `Err` carries the hard-reject issue.
pub fn sanitize(raw: &RawRecord) -> Result<Sanitized, Issue> {
    let kind = raw.kind();
    let issue = |category: IssueCategory, reason: String| {
        Issue::new(raw.sheet.clone(), raw.row_index, category, reason)
    };

    let date = parse_date(&raw.date)
        .ok_or_else(|| issue(IssueCategory::BadDate, format!("unparseable date {:?}", raw.date)))?;

    let mut warnings = Vec::new();

    let name = match normalize_name(&raw.name) {
        Some(name) => name,
        None => {
            warnings.push(issue(
                IssueCategory::MissingName,
                format!("name {:?} replaced with default", raw.name),
            ));
            format!("Unnamed {}", kind.label())
        }
    };

    let mut zip = raw.zip.trim().to_string();
    if !zip.is_empty() && !zip_pattern().is_match(&zip) {
        warnings.push(issue(IssueCategory::BadZipcode, format!("invalid zipcode {zip:?}")));
        zip.clear();
    }

    let link = checked_link(&raw.link, "link", &mut warnings, &issue);
    let coverage_url = checked_link(&raw.coverage_url, "coverage url", &mut warnings, &issue);

    let (mut turnout_low, mut turnout_high) = (None, None);
    if kind == RecordKind::Turnout {
        turnout_low = checked_estimate(&raw.turnout_low, "low", &mut warnings, &issue);
        turnout_high = checked_estimate(&raw.turnout_high, "high", &mut warnings, &issue);
        if let (Some(low), Some(high)) = (turnout_low, turnout_high) {
            if high < low {
                warnings.push(issue(
                    IssueCategory::BadTurnout,
                    format!("high estimate {high} below low estimate {low}; swapped"),
                ));
                turnout_low = Some(high);
                turnout_high = Some(low);
            }
        }
    }

    Ok(Sanitized {
        record: CleanRecord {
            sheet: raw.sheet.clone(),
            row_index: raw.row_index,
            kind,
            date,
            name,
            address: Address::new(
                collapse_whitespace(&raw.address),
                collapse_whitespace(&raw.city),
                collapse_whitespace(&raw.state),
                zip,
                collapse_whitespace(&raw.country),
            ),
            link,
            coverage_url,
            turnout_low,
            turnout_high,
            extensions: raw.extensions.clone(),
        },
        warnings,
    })
}

fn checked_link(
    value: &str,
    what: &str,
    warnings: &mut Vec<Issue>,
    issue: &impl Fn(IssueCategory, String) -> Issue,
) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.to_ascii_lowercase().starts_with("http") {
        Some(value.to_string())
    } else {
        warnings.push(issue(IssueCategory::BadLink, format!("{what} {value:?} lacks http scheme")));
        None
    }
}

fn checked_estimate(
    value: &str,
    what: &str,
    warnings: &mut Vec<Issue>,
    issue: &impl Fn(IssueCategory, String) -> Issue,
) -> Option<u64> {
    if value.trim().is_empty() {
        return None;
    }
    let parsed = parse_estimate(value);
    if parsed.is_none() {
        warnings.push(issue(
            IssueCategory::BadTurnout,
            format!("unparseable {what} estimate {value:?}"),
        ));
    }
    parsed
}

/// Title-cased name, or `None` for empty and placeholder names.
pub fn normalize_name(name: &str) -> Option<String> {
    let collapsed = collapse_whitespace(name);
    if collapsed.is_empty() || PLACEHOLDER_NAMES.contains(&collapsed.to_lowercase().as_str()) {
        return None;
    }
    Some(title_case(&collapsed))
}

/// Capitalize each word. Acronyms survive unless the whole name is shouted.
pub fn title_case(input: &str) -> String {
    let shouting = !input.chars().any(char::is_lowercase);
    input
        .split_whitespace()
        .map(|word| {
            let acronym = word.chars().filter(|c| c.is_alphabetic()).count() > 1
                && !word.chars().any(char::is_lowercase);
            if acronym && !shouting {
                word.to_string()
            } else {
                capitalize(word)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut seen_letter = false;
    for ch in word.chars() {
        if ch.is_alphabetic() && !seen_letter {
            out.extend(ch.to_uppercase());
            seen_letter = true;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let trimmed = collapse_whitespace(input);
    if trimmed.is_empty() {
        return None;
    }
    if let Some(date) = parse_slash_date(&trimmed) {
        return Some(date);
    }
    TEXT_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&trimmed, fmt).ok())
}

/// `M/D/YYYY` or `M/D/YY`; two-digit years are 20YY.
fn parse_slash_date(input: &str) -> Option<NaiveDate> {
    let parts = input.split('/').map(str::trim).collect::<Vec<_>>();
    let [month, day, year] = parts.as_slice() else {
        return None;
    };
    let month = month.parse::<u32>().ok()?;
    let day = day.parse::<u32>().ok()?;
    let year = match year.len() {
        2 => 2000 + year.parse::<i32>().ok()?,
        4 => year.parse::<i32>().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Crowd estimates: `"1,200"`, `"~500"`, `"500+"`, `"2k"`, `"1.5K"`.
pub fn parse_estimate(input: &str) -> Option<u64> {
    let cleaned = input
        .trim()
        .trim_start_matches(['~', '≈'])
        .trim_end_matches('+')
        .replace(',', "");
    let cleaned = cleaned.trim();
    let (number, multiplier) = match cleaned.strip_suffix(['k', 'K']) {
        Some(rest) => (rest.trim(), 1_000.0),
        None => (cleaned, 1.0),
    };
    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}
