//! First-seen-wins merge of normalized records into the collection.

use paperfeed_core::{Collection, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub collection: Collection,
    pub added: usize,
    pub skipped: usize,
}

/// Insert every incoming record whose id is not yet known; leave known ids untouched.
pub fn merge(existing: Collection, incoming: impl IntoIterator<Item = Record>) -> MergeOutcome {
    let mut collection = existing;
    let mut added = 0;
    let mut skipped = 0;
    for record in incoming {
        if collection.insert_if_absent(record) {
            added += 1;
        } else {
            skipped += 1;
        }
    }
    MergeOutcome {
        collection,
        added,
        skipped,
    }
}
