use image_hasher::{HashAlg, Hasher, HasherConfig};
use std::fs;

use crate::hasher::{content, PerceptualHash};
use crate::scanner::DiscoveredItem;
use crate::storage::models::{Fingerprint, Record, RecordStatus, ANALYZER_VERSION};

/// Turns one discovered item into a Record.
///
/// Implementations are total: every failure is encoded in the returned
/// record's status. A panic is treated by the pool as a worker crash.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, item: &DiscoveredItem) -> Record;
}

/// Content hash, pHash, dHash and dimensions of an image file.
pub struct ImageAnalyzer {
    phasher: Hasher,
    dhasher: Hasher,
}

impl Default for ImageAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageAnalyzer {
    pub fn new() -> Self {
        let phasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();
        let dhasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Gradient)
            .to_hasher();
        Self { phasher, dhasher }
    }

    fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint, String> {
        let format = image::guess_format(bytes).map_err(|e| e.to_string())?;
        let img = image::load_from_memory_with_format(bytes, format).map_err(|e| e.to_string())?;

        let phash = PerceptualHash::from_bytes(self.phasher.hash_image(&img).as_bytes())
            .ok_or_else(|| "phash is not 64 bits".to_string())?;
        let dhash = PerceptualHash::from_bytes(self.dhasher.hash_image(&img).as_bytes())
            .ok_or_else(|| "dhash is not 64 bits".to_string())?;

        Ok(Fingerprint {
            content_hash: content::hash_data(bytes),
            phash,
            dhash,
            width: img.width(),
            height: img.height(),
            format: format_name(format),
        })
    }
}

impl Analyzer for ImageAnalyzer {
    fn analyze(&self, item: &DiscoveredItem) -> Record {
        let status = match fs::read(&item.path) {
            Err(e) => RecordStatus::Unreadable {
                message: e.to_string(),
            },
            Ok(bytes) => match self.fingerprint(&bytes) {
                Ok(fingerprint) => RecordStatus::Ok(fingerprint),
                Err(message) => RecordStatus::Corrupt { message },
            },
        };
        new_record(item, status)
    }
}

/// Builds a record for `item` stamped with the current time and analyzer version.
pub fn new_record(item: &DiscoveredItem, status: RecordStatus) -> Record {
    Record {
        path: item.path_string(),
        file_name: item
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: item.size,
        mtime_ns: item.mtime_ns,
        analyzed_at: chrono::Utc::now().to_rfc3339(),
        analyzer_version: ANALYZER_VERSION.to_string(),
        status,
    }
}

fn format_name(format: image::ImageFormat) -> String {
    format!("{:?}", format).to_lowercase()
}
