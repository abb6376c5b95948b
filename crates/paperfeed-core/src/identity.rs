//! Stable identity keys derived from arXiv references.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?:https?://)?(?:www\.|export\.)?arxiv\.org/(?:abs|pdf)/|(?i:arxiv):)?(?P<id>\d{4}\.\d{4,5}|[a-z]+(?:-[a-z]+)*(?:\.[A-Z]{2})?/\d{7})(?:v(?P<version>\d+))?(?:\.pdf)?/?$",
    )
    .expect("arxiv reference regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed arXiv reference: {reference:?}")]
pub struct MalformedReferenceError {
    pub reference: String,
}

/// A parsed arXiv reference: the versionless short id plus the version, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArxivReference {
    pub id: String,
    pub version: Option<u32>,
}

pub fn parse_reference(raw: &str) -> Result<ArxivReference, MalformedReferenceError> {
    let malformed = || MalformedReferenceError {
        reference: raw.to_string(),
    };
    let caps = REFERENCE.captures(raw.trim()).ok_or_else(malformed)?;
    let id = caps.name("id").ok_or_else(malformed)?.as_str().to_string();
    let version = match caps.name("version") {
        Some(v) => Some(v.as_str().parse::<u32>().map_err(|_| malformed())?),
        None => None,
    };
    Ok(ArxivReference { id, version })
}

/// Identity key for a raw reference. Version suffixes are dropped, so every version
/// of a paper shares one key.
pub fn resolve(raw: &str) -> Result<String, MalformedReferenceError> {
    parse_reference(raw).map(|r| r.id)
}
