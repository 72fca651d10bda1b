pub mod buckets;
pub mod diff;
pub mod duplicates;
pub mod leakage;
pub mod union_find;

pub use buckets::MatchStats;
pub use diff::{diff_manifests, ChangedRecord, ManifestDiff, SideSummary};
pub use duplicates::{find_duplicates, Cluster, ClusterKind, DuplicateReport, ExcludedRecord};
pub use leakage::{find_leakage, LabeledPath, LabeledRecords, LeakageCluster, LeakageReport};
pub use union_find::UnionFind;
