pub mod walk;

pub use walk::{discover, mtime_to_ns, DiscoveredItem};
