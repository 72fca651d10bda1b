use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

use super::buckets::{cluster_hashes, HashedItem, MatchStats};
use crate::config::ClusterConfig;
use crate::error::Error;
use crate::storage::models::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    /// Every member has the same content hash.
    Exact,
    Near,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Lexicographically smallest member path.
    pub representative: String,
    pub kind: ClusterKind,
    /// Sorted, at least two.
    pub members: Vec<String>,
}

/// A record left out of clustering because it has no fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedRecord {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateReport {
    /// Sorted by representative.
    pub clusters: Vec<Cluster>,
    pub excluded: Vec<ExcludedRecord>,
    pub records_clustered: usize,
    pub comparisons: u64,
    pub buckets: usize,
    pub skipped_buckets: usize,
}

impl DuplicateReport {
    pub fn exact_clusters(&self) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.kind == ClusterKind::Exact)
            .count()
    }

    /// Files that could be removed while keeping one per cluster.
    pub fn redundant_files(&self) -> usize {
        self.clusters.iter().map(|c| c.members.len() - 1).sum()
    }
}

/// Groups `ok` records into exact and near-duplicate clusters.
///
/// Pass the last-write-wins view of a manifest; a path appearing twice would
/// be clustered with itself.
pub fn find_duplicates(records: &[Record], config: &ClusterConfig) -> Result<DuplicateReport, Error> {
    config.validate()?;
    let start = Instant::now();
    info!(
        "Clustering {} records (threshold={}, bands={}x{} bits, radius={}, field={:?})",
        records.len(),
        config.threshold,
        config.bands,
        config.prefix_bits,
        config.radius(),
        config.hash_field
    );

    let mut excluded = Vec::new();
    let mut clustered: Vec<&Record> = Vec::with_capacity(records.len());
    let mut items: Vec<HashedItem<'_>> = Vec::with_capacity(records.len());
    for record in records {
        match record.fingerprint() {
            Some(fingerprint) => {
                clustered.push(record);
                items.push(HashedItem {
                    content_hash: &fingerprint.content_hash,
                    hash: fingerprint.perceptual(config.hash_field),
                });
            }
            None => excluded.push(ExcludedRecord {
                path: record.path.clone(),
                status: record.status_name().to_string(),
            }),
        }
    }
    excluded.sort_by(|a, b| a.path.cmp(&b.path));

    let (mut uf, stats) = cluster_hashes(&items, config);
    let mut clusters: Vec<Cluster> = uf
        .groups()
        .into_iter()
        .map(|group| {
            let kind = if group
                .iter()
                .all(|&i| items[i as usize].content_hash == items[group[0] as usize].content_hash)
            {
                ClusterKind::Exact
            } else {
                ClusterKind::Near
            };
            let mut members: Vec<String> = group
                .iter()
                .map(|&i| clustered[i as usize].path.clone())
                .collect();
            members.sort();
            Cluster {
                representative: members[0].clone(),
                kind,
                members,
            }
        })
        .collect();
    clusters.sort_by(|a, b| a.representative.cmp(&b.representative));

    info!(
        "Found {} duplicate clusters in {:.2}s ({} records excluded)",
        clusters.len(),
        start.elapsed().as_secs_f64(),
        excluded.len()
    );

    let MatchStats {
        buckets,
        comparisons,
        skipped_buckets,
        ..
    } = stats;
    Ok(DuplicateReport {
        clusters,
        excluded,
        records_clustered: items.len(),
        comparisons,
        buckets,
        skipped_buckets,
    })
}
