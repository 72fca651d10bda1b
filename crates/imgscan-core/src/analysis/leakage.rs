use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

use super::buckets::{cluster_hashes, HashedItem};
use crate::config::ClusterConfig;
use crate::error::Error;
use crate::storage::models::Record;

/// Records of one independently scanned collection, e.g. `train`.
#[derive(Debug, Clone)]
pub struct LabeledRecords {
    pub label: String,
    pub records: Vec<Record>,
}

impl LabeledRecords {
    pub fn new(label: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            label: label.into(),
            records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabeledPath {
    pub label: String,
    pub path: String,
}

/// A duplicate cluster spanning at least two labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakageCluster {
    pub labels: BTreeSet<String>,
    /// Sorted by label, then path.
    pub members: Vec<LabeledPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakageReport {
    pub clusters: Vec<LeakageCluster>,
    /// Duplicate clusters confined to one label, not reported.
    pub suppressed_single_label: usize,
    pub comparisons: u64,
}

impl LeakageReport {
    /// Number of leaked clusters touching each label pair.
    pub fn pair_counts(&self) -> Vec<((String, String), usize)> {
        let mut counts: std::collections::BTreeMap<(String, String), usize> = Default::default();
        for cluster in &self.clusters {
            let labels: Vec<&String> = cluster.labels.iter().collect();
            for (i, a) in labels.iter().enumerate() {
                for b in &labels[i + 1..] {
                    *counts.entry(((*a).clone(), (*b).clone())).or_default() += 1;
                }
            }
        }
        counts.into_iter().collect()
    }
}

/// Clusters the union of all labeled sets and keeps clusters whose members
/// come from two or more labels. Identity is `(label, path)`, so the same
/// path scanned under two labels is two items.
pub fn find_leakage(sets: &[LabeledRecords], config: &ClusterConfig) -> Result<LeakageReport, Error> {
    config.validate()?;

    let mut members: Vec<(&str, &Record)> = Vec::new();
    let mut items: Vec<HashedItem<'_>> = Vec::new();
    for set in sets {
        for record in &set.records {
            if let Some(fingerprint) = record.fingerprint() {
                members.push((set.label.as_str(), record));
                items.push(HashedItem {
                    content_hash: &fingerprint.content_hash,
                    hash: fingerprint.perceptual(config.hash_field),
                });
            }
        }
    }
    info!(
        "Checking {} records across {} labels for leakage",
        items.len(),
        sets.len()
    );

    let (mut uf, stats) = cluster_hashes(&items, config);
    let mut report = LeakageReport {
        comparisons: stats.comparisons,
        ..LeakageReport::default()
    };

    for group in uf.groups() {
        let labels: BTreeSet<String> = group
            .iter()
            .map(|&i| members[i as usize].0.to_string())
            .collect();
        if labels.len() < 2 {
            report.suppressed_single_label += 1;
            continue;
        }
        let mut paths: Vec<LabeledPath> = group
            .iter()
            .map(|&i| {
                let (label, record) = members[i as usize];
                LabeledPath {
                    label: label.to_string(),
                    path: record.path.clone(),
                }
            })
            .collect();
        paths.sort();
        report.clusters.push(LeakageCluster {
            labels,
            members: paths,
        });
    }
    report.clusters.sort_by(|a, b| a.members.cmp(&b.members));

    info!(
        "Found {} leaked clusters ({} single-label clusters suppressed)",
        report.clusters.len(),
        report.suppressed_single_label
    );
    Ok(report)
}
