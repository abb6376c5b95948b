//! Raw listing entry → canonical [`Record`].

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use paperfeed_core::{identity, MalformedReferenceError, RawRecord, Record};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    MalformedReference(#[from] MalformedReferenceError),
}

pub fn normalize(raw: &RawRecord) -> Result<Record, NormalizationError> {
    let reference = non_blank(raw.reference.as_deref())
        .ok_or(NormalizationError::MissingField("reference"))?;
    let title = non_blank(raw.title.as_deref())
        .map(collapse_whitespace)
        .ok_or(NormalizationError::MissingField("title"))?;
    let id = identity::resolve(reference)?;

    Ok(Record {
        id,
        title,
        authors: raw
            .authors
            .iter()
            .filter_map(|a| non_blank(Some(a.as_str())).map(collapse_whitespace))
            .collect(),
        subjects: raw
            .categories
            .iter()
            .filter_map(|c| non_blank(Some(c.as_str())).map(str::to_string))
            .collect::<BTreeSet<_>>(),
        summary: raw
            .summary
            .as_deref()
            .map(collapse_whitespace)
            .unwrap_or_default(),
        published: raw.published.as_deref().and_then(parse_published),
        url: reference.to_string(),
    })
}

/// Normalized records of one page plus the number of entries that had to be dropped.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    pub dropped: usize,
}

pub fn normalize_batch(raw: &[RawRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for entry in raw {
        match normalize(entry) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                tracing::debug!(reference = ?entry.reference, error = %err, "dropping listing entry");
                batch.dropped += 1;
            }
        }
    }
    batch
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accepts RFC 3339, a zone-less `YYYY-MM-DDTHH:MM:SS` (read as UTC) or a bare date.
pub fn parse_published(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
