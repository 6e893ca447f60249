//! Simulator configuration.
//!
//! All knobs the orchestrator and detector consume: the log directory, the
//! drift threshold, simulated latency bounds, and the snapshot file names.
//! The channel-capture snapshot and the hierarchical merged snapshot have
//! different document shapes, so they persist under distinct (configurable)
//! filenames and can never overwrite each other.

use std::path::PathBuf;

/// Continent regions with their physical-clock offsets in milliseconds.
///
/// The default global fleet assigns each continent a skew class so drift
/// anomalies appear organically in cross-region traffic.
pub const CONTINENT_OFFSETS: [(&str, i64); 7] = [
    ("NA", 0),
    ("EU", 5_000),
    ("AS", 10_000),
    ("AF", 15_000),
    ("SA", 20_000),
    ("AU", 25_000),
    ("AN", 30_000),
];

/// Configuration for the simulator runtime.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Directory holding every journal and snapshot document.
    pub log_dir: PathBuf,
    /// Absolute HLC-vs-wall divergence (ms) above which drift is flagged.
    pub drift_threshold_ms: u64,
    /// Nodes created per region by the global fleet setup.
    pub nodes_per_region: usize,
    /// Lower bound of the simulated delivery latency (ms), inclusive.
    pub latency_min_ms: u64,
    /// Upper bound of the simulated delivery latency (ms), inclusive.
    pub latency_max_ms: u64,
    /// Delivery journal file name (JSON lines).
    pub deliveries_file: String,
    /// Anomaly journal file name (JSON lines).
    pub anomalies_file: String,
    /// Channel-capture (Chandy-Lamport style) snapshot file name.
    pub channel_snapshot_file: String,
    /// Hierarchical merged snapshot file name.
    pub merged_snapshot_file: String,
    /// Snapshot diff file name.
    pub diff_file: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            drift_threshold_ms: 2_000,
            nodes_per_region: 200,
            latency_min_ms: 10,
            latency_max_ms: 200,
            deliveries_file: "deliveries.jsonl".to_string(),
            anomalies_file: "anomalies.jsonl".to_string(),
            channel_snapshot_file: "channel_snapshot.json".to_string(),
            merged_snapshot_file: "global_snapshot.json".to_string(),
            diff_file: "snapshot_diff.json".to_string(),
        }
    }
}

impl SimConfig {
    /// Convenience constructor rooting all artifacts under `log_dir`.
    #[must_use]
    pub fn with_log_dir(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    /// Path of the delivery journal.
    #[must_use]
    pub fn deliveries_path(&self) -> PathBuf {
        self.log_dir.join(&self.deliveries_file)
    }

    /// Path of the anomaly journal.
    #[must_use]
    pub fn anomalies_path(&self) -> PathBuf {
        self.log_dir.join(&self.anomalies_file)
    }

    /// Path of the channel-capture snapshot document.
    #[must_use]
    pub fn channel_snapshot_path(&self) -> PathBuf {
        self.log_dir.join(&self.channel_snapshot_file)
    }

    /// Path of the hierarchical merged snapshot document.
    #[must_use]
    pub fn merged_snapshot_path(&self) -> PathBuf {
        self.log_dir.join(&self.merged_snapshot_file)
    }

    /// Path of the snapshot diff document.
    #[must_use]
    pub fn diff_path(&self) -> PathBuf {
        self.log_dir.join(&self.diff_file)
    }

    /// Path of one region's merged snapshot document.
    #[must_use]
    pub fn region_snapshot_path(&self, region_id: &str) -> PathBuf {
        self.log_dir.join(format!("region_{region_id}_snapshot.json"))
    }

    /// Path of one node's private event journal.
    #[must_use]
    pub fn node_log_path(&self, node_id: &str) -> PathBuf {
        self.log_dir.join(format!("{node_id}.log"))
    }
}
