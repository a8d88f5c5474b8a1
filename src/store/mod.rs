//! Store kernel: entry model, indexed map, pruning and metrics.

pub mod entry;
pub mod kernel;
pub mod metrics;
pub mod pruner;

pub use entry::{
    sniff_content_type, EntryState, HashAlgorithm, KeyEntry, KeyMetric, LockRecord, Revision,
};
pub use kernel::{Caller, InspectOptions, Kernel, KernelStats, KeyInfo, SetOutcome, SetParams};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use pruner::{PruneRun, Pruner};

/// Serde adapter: opaque value bytes as base64 strings in JSON.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
