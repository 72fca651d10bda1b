use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;
use crate::hasher::perceptual::neighbor_count;

pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_HAMMING_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub clustering: ClusterConfig,
}

/// Settings for one scan run. Snapshotted into the manifest header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub workers: usize,
    /// Records buffered in memory before a checkpoint flush.
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// How long a draining scan waits for in-flight items.
    pub grace_period_ms: u64,
    pub extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub resume: bool,
    pub force: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: 30_000,
            grace_period_ms: 10_000,
            extensions: ["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp", "gif"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            ignore_patterns: Vec::new(),
            resume: true,
            force: false,
        }
    }
}

impl ScanConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Which perceptual hash drives bucketing and distance checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashField {
    Phash,
    Dhash,
}

/// Upper bound on neighbor prefixes looked up per bucket.
pub const MAX_NEIGHBOR_PREFIXES: u64 = 4096;

/// Hash bucketing settings.
///
/// Each record lands in one bucket per band, where band `k` is the `k`-th
/// run of `prefix_bits` bits counted from the most significant end (band 0
/// is the leading prefix). Two hashes within `threshold` bits of each other
/// differ in at most `threshold / bands` bits in some band, so searching every
/// bucket within that many flips finds every pair at or under the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Inclusive Hamming distance bound for a near-duplicate match.
    pub threshold: u32,
    /// Width of each band key.
    pub prefix_bits: u32,
    /// Disjoint bands bucketed independently. `bands * prefix_bits` must fit in 64.
    pub bands: u32,
    /// Bucket prefixes within this many bit flips are also compared. Unset
    /// derives the smallest radius that finds every pair at the threshold.
    /// A smaller explicit value trades recall for fewer comparisons.
    pub neighbor_radius: Option<u32>,
    pub hash_field: HashField,
    pub max_bucket_size: Option<usize>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_HAMMING_THRESHOLD,
            prefix_bits: 16,
            bands: 4,
            neighbor_radius: None,
            hash_field: HashField::Phash,
            max_bucket_size: None,
        }
    }
}

impl ClusterConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Neighbor radius in effect: the configured one, else `threshold / bands`.
    pub fn radius(&self) -> u32 {
        self.neighbor_radius
            .unwrap_or(self.threshold / self.bands.max(1))
    }

    /// Whether every pair within `threshold` bits is guaranteed to share a
    /// searched bucket. Pigeonhole: a pair is only missed when every band
    /// differs in more than `radius` bits.
    pub fn guarantees_recall(&self) -> bool {
        u64::from(self.bands) * (u64::from(self.radius()) + 1) > u64::from(self.threshold)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=64).contains(&self.prefix_bits) {
            return Err(Error::InvalidConfig(format!(
                "prefix_bits must be within 1..=64, got {}",
                self.prefix_bits
            )));
        }
        if self.bands == 0 || self.bands.checked_mul(self.prefix_bits).map_or(true, |bits| bits > 64) {
            return Err(Error::InvalidConfig(format!(
                "{} bands of {} bits do not fit in a 64-bit hash",
                self.bands, self.prefix_bits
            )));
        }
        if self.threshold > 64 {
            return Err(Error::InvalidConfig(format!(
                "threshold must be at most 64, got {}",
                self.threshold
            )));
        }
        let radius = self.radius();
        if radius > self.prefix_bits {
            return Err(Error::InvalidConfig(format!(
                "neighbor_radius {} exceeds prefix_bits {}",
                radius, self.prefix_bits
            )));
        }
        let lookups = neighbor_count(self.prefix_bits, radius);
        if lookups > MAX_NEIGHBOR_PREFIXES {
            return Err(Error::InvalidConfig(format!(
                "radius {} over {}-bit bands looks up {} neighbor buckets (max {}); \
                 use more, narrower bands or a lower threshold",
                radius, self.prefix_bits, lookups, MAX_NEIGHBOR_PREFIXES
            )));
        }
        Ok(())
    }
}

/// Loads `Imgscan.{toml,yaml,json}` from the working directory when present,
/// then `IMGSCAN__SECTION__KEY` environment overrides.
pub fn load_configuration() -> Result<AppConfig, Error> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Imgscan").required(false))
        .add_source(Environment::with_prefix("IMGSCAN").separator("__"))
        .build()?;
    Ok(builder.try_deserialize::<AppConfig>()?)
}
