pub mod manifest;
pub mod models;
pub mod resume;
pub mod writer;

pub use manifest::{DiscardedTail, Manifest, ManifestStore};
pub use models::{Fingerprint, IdentityKey, ManifestHeader, Record, RecordStatus, ScanSummary};
pub use resume::ResumeIndex;
pub use writer::{ManifestWriter, RecordSink};
