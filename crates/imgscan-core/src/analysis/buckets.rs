use ahash::AHashMap;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::union_find::UnionFind;
use crate::config::ClusterConfig;
use crate::hasher::perceptual::neighbor_prefixes;
use crate::hasher::PerceptualHash;

/// What the matcher needs from each clustered item.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HashedItem<'a> {
    pub content_hash: &'a str,
    pub hash: PerceptualHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchStats {
    pub buckets: usize,
    /// Full Hamming distance computations performed.
    pub comparisons: u64,
    pub skipped_buckets: usize,
    /// Items in skipped buckets. They can still join a cluster via exact content hash.
    pub skipped_items: usize,
}

/// Band index and band value.
type BucketKey = (u32, u64);

/// Groups items whose content hashes are equal or whose perceptual hashes
/// are within `config.threshold` bits.
///
/// 1. Union identical content hashes
/// 2. Bucket every item once per band
/// 3. Compare pairs inside each bucket and against neighbor buckets of the same band, in parallel
/// 4. Merge the matching pairs serially
pub(crate) fn cluster_hashes(items: &[HashedItem<'_>], config: &ClusterConfig) -> (UnionFind, MatchStats) {
    let mut uf = UnionFind::new(items.len());
    let mut stats = MatchStats::default();

    let mut first_by_content: AHashMap<&str, u32> = AHashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let i = i as u32;
        match first_by_content.get(item.content_hash) {
            Some(&first) => {
                uf.union(first, i);
            }
            None => {
                first_by_content.insert(item.content_hash, i);
            }
        }
    }

    if !config.guarantees_recall() {
        warn!(
            "neighbor_radius {} over {} bands cannot find every pair within {} bits",
            config.radius(),
            config.bands,
            config.threshold
        );
    }

    let mut buckets: AHashMap<BucketKey, Vec<u32>> = AHashMap::new();
    for band in 0..config.bands {
        for (i, item) in items.iter().enumerate() {
            buckets
                .entry((band, item.hash.band(band, config.prefix_bits)))
                .or_default()
                .push(i as u32);
        }
    }
    stats.buckets = buckets.len();

    if let Some(max) = config.max_bucket_size {
        buckets.retain(|(band, prefix), members| {
            if members.len() > max {
                warn!(
                    "Skipping band {} bucket {:x} with {} items (max_bucket_size {})",
                    band,
                    prefix,
                    members.len(),
                    max
                );
                stats.skipped_buckets += 1;
                stats.skipped_items += members.len();
                false
            } else {
                true
            }
        });
    }

    let mut keys: Vec<BucketKey> = buckets.keys().copied().collect();
    keys.sort_unstable();

    let per_bucket: Vec<(Vec<(u32, u32)>, u64)> = keys
        .par_iter()
        .map(|&key| match_bucket(key, items, &buckets, config))
        .collect();

    let mut merged = 0usize;
    for (pairs, comparisons) in per_bucket {
        stats.comparisons += comparisons;
        for (a, b) in pairs {
            if uf.union(a, b) {
                merged += 1;
            }
        }
    }

    debug!(
        "{} buckets, {} comparisons, {} merges",
        stats.buckets, stats.comparisons, merged
    );
    info!(
        "Compared {} items in {} buckets ({} comparisons)",
        items.len(),
        stats.buckets,
        stats.comparisons
    );
    (uf, stats)
}

/// Matching pairs within `key`'s bucket and between it and each neighbor
/// bucket of the same band with a larger value, so every bucket pair is
/// visited once per band.
fn match_bucket(
    key: BucketKey,
    items: &[HashedItem<'_>],
    buckets: &AHashMap<BucketKey, Vec<u32>>,
    config: &ClusterConfig,
) -> (Vec<(u32, u32)>, u64) {
    let mut pairs = Vec::new();
    let mut comparisons = 0u64;
    let Some(members) = buckets.get(&key) else {
        return (pairs, comparisons);
    };
    let (band, prefix) = key;
    let radius = config.radius();

    let mut check = |a: u32, b: u32| {
        let (x, y) = (items[a as usize].hash, items[b as usize].hash);
        if covered_by_earlier_band(x, y, band, radius, buckets, config) {
            return;
        }
        comparisons += 1;
        if x.distance(y) <= config.threshold {
            pairs.push((a, b));
        }
    };

    for (i, &a) in members.iter().enumerate() {
        for &b in &members[i + 1..] {
            check(a, b);
        }
    }

    if radius > 0 {
        for neighbor in neighbor_prefixes(prefix, config.prefix_bits, radius) {
            if neighbor <= prefix {
                continue;
            }
            if let Some(others) = buckets.get(&(band, neighbor)) {
                for &a in members {
                    for &b in others {
                        check(a, b);
                    }
                }
            }
        }
    }

    (pairs, comparisons)
}

/// Whether a lower band already put `x` and `y` in the same or neighboring
/// kept buckets, in which case that band compared them.
fn covered_by_earlier_band(
    x: PerceptualHash,
    y: PerceptualHash,
    band: u32,
    radius: u32,
    buckets: &AHashMap<BucketKey, Vec<u32>>,
    config: &ClusterConfig,
) -> bool {
    (0..band).any(|earlier| {
        let (bx, by) = (x.band(earlier, config.prefix_bits), y.band(earlier, config.prefix_bits));
        (bx ^ by).count_ones() <= radius
            && buckets.contains_key(&(earlier, bx))
            && buckets.contains_key(&(earlier, by))
    })
}
