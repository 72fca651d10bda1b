use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::storage::models::Record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRecord {
    pub path: String,
    /// Names of the fields that differ: size, status, content_hash, phash, dimensions, format.
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideSummary {
    pub records: usize,
    pub not_ok: usize,
    /// Groups of two or more records sharing a content hash.
    pub exact_duplicate_groups: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged: usize,
    pub old: SideSummary,
    pub new: SideSummary,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compares two last-write-wins record views by path. Output lists are sorted.
pub fn diff_manifests(old: &[Record], new: &[Record]) -> ManifestDiff {
    let old_by_path: AHashMap<&str, &Record> = old.iter().map(|r| (r.path.as_str(), r)).collect();
    let new_by_path: AHashMap<&str, &Record> = new.iter().map(|r| (r.path.as_str(), r)).collect();

    let mut diff = ManifestDiff {
        old: summarize(old),
        new: summarize(new),
        ..ManifestDiff::default()
    };

    for (path, after) in &new_by_path {
        match old_by_path.get(path) {
            None => diff.added.push(path.to_string()),
            Some(before) => {
                let fields = changed_fields(before, after);
                if fields.is_empty() {
                    diff.unchanged += 1;
                } else {
                    diff.changed.push(ChangedRecord {
                        path: path.to_string(),
                        fields,
                    });
                }
            }
        }
    }
    diff.removed = old_by_path
        .keys()
        .filter(|path| !new_by_path.contains_key(*path))
        .map(|path| path.to_string())
        .collect();

    diff.added.sort();
    diff.removed.sort();
    diff.changed.sort_by(|a, b| a.path.cmp(&b.path));
    diff
}

fn changed_fields(before: &Record, after: &Record) -> Vec<String> {
    let mut fields = Vec::new();
    if before.size != after.size {
        fields.push("size");
    }
    if before.status_name() != after.status_name() {
        fields.push("status");
    }
    if let (Some(a), Some(b)) = (before.fingerprint(), after.fingerprint()) {
        if a.content_hash != b.content_hash {
            fields.push("content_hash");
        }
        if a.phash != b.phash {
            fields.push("phash");
        }
        if (a.width, a.height) != (b.width, b.height) {
            fields.push("dimensions");
        }
        if a.format != b.format {
            fields.push("format");
        }
    }
    fields.into_iter().map(String::from).collect()
}

fn summarize(records: &[Record]) -> SideSummary {
    let mut counts: AHashMap<&str, usize> = AHashMap::new();
    let mut not_ok = 0;
    for record in records {
        match record.fingerprint() {
            Some(fingerprint) => *counts.entry(fingerprint.content_hash.as_str()).or_default() += 1,
            None => not_ok += 1,
        }
    }
    let paths: AHashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
    SideSummary {
        records: paths.len(),
        not_ok,
        exact_duplicate_groups: counts.values().filter(|&&n| n > 1).count(),
    }
}
