use serde::{Deserialize, Serialize};

use crate::config::{HashField, ScanConfig};
use crate::hasher::PerceptualHash;
use crate::pipeline::ScanStatus;

pub const MANIFEST_META_KEY: &str = "__manifest_meta__";
pub const SCHEMA_VERSION: u32 = 1;
pub const ANALYZER_VERSION: &str = "1";

/// Resume identity of one file: `(path, size, mtime_ns)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub path: String,
    pub size: u64,
    pub mtime_ns: i64,
}

/// What a successful analysis yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub content_hash: String,
    pub phash: PerceptualHash,
    pub dhash: PerceptualHash,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

impl Fingerprint {
    pub fn perceptual(&self, field: HashField) -> PerceptualHash {
        match field {
            HashField::Phash => self.phash,
            HashField::Dhash => self.dhash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Ok(Fingerprint),
    Corrupt { message: String },
    Unreadable { message: String },
}

/// One analyzed file. Immutable once appended to a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub path: String,
    pub file_name: String,
    pub size: u64,
    pub mtime_ns: i64,
    pub analyzed_at: String,
    pub analyzer_version: String,
    #[serde(flatten)]
    pub status: RecordStatus,
}

impl Record {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            path: self.path.clone(),
            size: self.size,
            mtime_ns: self.mtime_ns,
        }
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match &self.status {
            RecordStatus::Ok(fingerprint) => Some(fingerprint),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, RecordStatus::Ok(_))
    }

    pub fn status_name(&self) -> &'static str {
        match self.status {
            RecordStatus::Ok(_) => "ok",
            RecordStatus::Corrupt { .. } => "corrupt",
            RecordStatus::Unreadable { .. } => "unreadable",
        }
    }
}

/// Outcome of the most recent scan against a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub status: ScanStatus,
    pub records_written: u64,
    pub finished_at: String,
}

/// First line of every manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestHeader {
    #[serde(rename = "__manifest_meta__")]
    pub is_meta: bool,
    pub schema_version: u32,
    pub source_root: String,
    pub created_at: String,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub settings: ScanConfig,
    #[serde(default)]
    pub last_scan: Option<ScanSummary>,
}

impl ManifestHeader {
    pub fn new(source_root: impl Into<String>, settings: ScanConfig) -> Self {
        Self {
            is_meta: true,
            schema_version: SCHEMA_VERSION,
            source_root: source_root.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            total_files: 0,
            settings,
            last_scan: None,
        }
    }
}
