use glob::Pattern;
use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{error, warn};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::storage::IdentityKey;

/// A file found on disk, before analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ns: i64,
}

impl DiscoveredItem {
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let mtime_ns = metadata.modified().map(mtime_to_ns).unwrap_or(0);
        Self {
            path,
            size: metadata.len(),
            mtime_ns,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            path: self.path_string(),
            size: self.size,
            mtime_ns: self.mtime_ns,
        }
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Signed nanoseconds since the Unix epoch.
pub fn mtime_to_ns(time: std::time::SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i64,
        Err(before) => -(before.duration().as_nanos() as i64),
    }
}

/// Lazily walks `root` in file-name order, yielding files whose extension is
/// in `config.extensions` and that match no ignore pattern. Symlinks are not
/// followed. Unreadable entries are logged and skipped.
pub fn discover(root: &Path, config: &ScanConfig) -> impl Iterator<Item = DiscoveredItem> {
    let extensions: HashSet<String> = config
        .extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_lowercase())
        .collect();

    let ignore_patterns: Vec<Pattern> = config
        .ignore_patterns
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect();

    let root = root.to_path_buf();
    WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!("Error walking {}: {}", root.display(), err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| has_extension(entry.path(), &extensions))
        .filter(move |entry| {
            !ignore_patterns
                .iter()
                .any(|pattern| pattern.matches_path(entry.path()))
        })
        .filter_map(|entry| match entry.metadata() {
            Ok(metadata) => Some(DiscoveredItem::from_metadata(
                entry.into_path(),
                &metadata,
            )),
            Err(err) => {
                warn!("Error getting metadata for {}: {}", entry.path().display(), err);
                None
            }
        })
}

fn has_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .map(|ext| extensions.contains(&ext.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}
