//! Paginated per-subject summaries written next to the store for static frontends.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use paperfeed_core::{Collection, Record};
use paperfeed_storage::write_json_atomic;
use serde::Serialize;
use tracing::info;

pub const SUBJECT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub authors: &'a [String],
    pub published: Option<DateTime<Utc>>,
    pub url: &'a str,
}

impl<'a> From<&'a Record> for RecordSummary<'a> {
    fn from(record: &'a Record) -> Self {
        Self {
            id: &record.id,
            title: &record.title,
            authors: &record.authors,
            published: record.published,
            url: &record.url,
        }
    }
}

/// `subjects/` directory beside the store file.
pub fn subject_pages_dir(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("subjects")
}

/// Records tagged with `subject`, newest first; undated records last, ties by id.
pub fn records_for_subject<'a>(collection: &'a Collection, subject: &str) -> Vec<&'a Record> {
    let mut records: Vec<&Record> = collection
        .records()
        .filter(|r| r.subjects.contains(subject))
        .collect();
    records.sort_by(|a, b| {
        Reverse(a.published)
            .cmp(&Reverse(b.published))
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}

/// Write `<out_dir>/<subject>/page_<n>.json` for each subject. Returns the number of
/// page files written.
pub async fn export_subject_pages(
    collection: &Collection,
    out_dir: &Path,
    subjects: &[String],
    page_size: usize,
) -> Result<usize> {
    let page_size = page_size.max(1);
    let mut written = 0usize;
    for subject in subjects {
        let records = records_for_subject(collection, subject);
        if records.is_empty() {
            continue;
        }
        let subject_dir = out_dir.join(subject.replace('/', "_"));
        for (index, chunk) in records.chunks(page_size).enumerate() {
            let page: Vec<RecordSummary<'_>> = chunk.iter().map(|r| RecordSummary::from(*r)).collect();
            let path = subject_dir.join(format!("page_{}.json", index + 1));
            write_json_atomic(&path, &page)
                .await
                .with_context(|| format!("writing subject page {}", path.display()))?;
            written += 1;
        }
        info!(subject = %subject, pages = records.len().div_ceil(page_size), "subject pages written");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn record(id: &str, day: Option<u32>, subjects: &[&str]) -> Record {
        Record {
            id: id.to_string(),
            title: format!("Paper {id}"),
            authors: vec!["Ada Lovelace".into()],
            subjects: subjects.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            summary: "Long abstract that stays out of the summaries.".into(),
            published: day.and_then(|d| Utc.with_ymd_and_hms(2023, 1, d, 0, 0, 0).single()),
            url: format!("http://arxiv.org/abs/{id}v1"),
        }
    }

    #[test]
    fn subject_records_are_newest_first() {
        let collection: Collection = vec![
            record("2301.00001", Some(1), &["cs.AI"]),
            record("2301.00002", Some(3), &["cs.AI", "cs.LG"]),
            record("2301.00003", None, &["cs.AI"]),
            record("2301.00004", Some(3), &["cs.AI"]),
            record("2301.00005", Some(9), &["math.CO"]),
        ]
        .into_iter()
        .collect();
        let ids: Vec<&str> = records_for_subject(&collection, "cs.AI")
            .into_iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["2301.00002", "2301.00004", "2301.00001", "2301.00003"]);
    }

    #[tokio::test]
    async fn writes_paginated_summaries() {
        let dir = tempdir().expect("tempdir");
        let collection: Collection = (1..=5)
            .map(|i| record(&format!("2301.0000{i}"), Some(i), &["cs.AI"]))
            .collect();

        let written = export_subject_pages(
            &collection,
            dir.path(),
            &["cs.AI".to_string(), "q-bio.NC".to_string()],
            2,
        )
        .await
        .expect("export");
        assert_eq!(written, 3);

        let first: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("cs.AI/page_1.json")).expect("page 1"),
        )
        .expect("json");
        let first = first.as_array().expect("array");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["id"], "2301.00005");
        assert!(first[0].get("summary").is_none());

        assert!(dir.path().join("cs.AI/page_3.json").exists());
        assert!(!dir.path().join("q-bio.NC").exists());
    }
}
