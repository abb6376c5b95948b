//! Core domain model for Paperfeed: raw listing entries, normalized records and the
//! persisted collection.

use std::collections::btree_map::{self, Entry};
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod identity;

pub use identity::{parse_reference, resolve, ArxivReference, MalformedReferenceError};

pub const CRATE_NAME: &str = "paperfeed-core";

/// Unprocessed entry as returned by a listing source for one page.
///
/// Every field is optional or possibly blank; the normalizer decides what is usable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub reference: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub summary: Option<String>,
    pub published: Option<String>,
}

/// Canonical persisted publication metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub subjects: BTreeSet<String>,
    #[serde(default)]
    pub summary: String,
    pub published: Option<DateTime<Utc>>,
    pub url: String,
}

/// Every known record, keyed by identity.
///
/// Serialized as a plain JSON object whose keys come out sorted, so repeated runs
/// produce byte-stable files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection {
    records: BTreeMap<String, Record>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Insert `record` under its own id unless that id is already taken.
    ///
    /// Returns `true` when the record was inserted. A stored record is never replaced.
    pub fn insert_if_absent(&mut self, record: Record) -> bool {
        match self.records.entry(record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Record> {
        self.records.iter()
    }

    pub fn records(&self) -> btree_map::Values<'_, String, Record> {
        self.records.values()
    }

    /// First entry whose map key differs from the id of the record stored under it.
    ///
    /// Only a hand-edited or foreign file can contain one; such an entry would let the
    /// same identity be inserted a second time.
    pub fn mismatched_key(&self) -> Option<(&str, &str)> {
        self.records
            .iter()
            .find(|(key, record)| **key != record.id)
            .map(|(key, record)| (key.as_str(), record.id.as_str()))
    }

    /// Every subject category mentioned by at least one record.
    pub fn subjects(&self) -> BTreeSet<String> {
        self.records
            .values()
            .flat_map(|r| r.subjects.iter().cloned())
            .collect()
    }
}

impl FromIterator<Record> for Collection {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut collection = Collection::new();
        for record in iter {
            collection.insert_if_absent(record);
        }
        collection
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = (&'a String, &'a Record);
    type IntoIter = btree_map::Iter<'a, String, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
