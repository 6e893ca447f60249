//! Courier Simulator — skewed node fleets, timing-anomaly detection, and
//! hierarchical snapshots over a Hybrid Logical Clock.
//!
//! The orchestrator drives synchronous deliveries between nodes whose
//! physical clocks are deliberately skewed, journals every delivery and
//! anomaly as JSON lines, and captures causally consistent snapshots both as
//! channel cuts (per-node state plus in-flight messages) and as
//! deterministically merged global views.

pub mod config;
pub mod detector;
pub mod error;
pub mod journal;
pub mod node;
pub mod orchestrator;
pub mod tasks;

pub use config::{SimConfig, CONTINENT_OFFSETS};
pub use detector::AnomalyDetector;
pub use error::OrchestratorError;
pub use journal::{persist_json_atomic, read_json_lines, Journal};
pub use node::Node;
pub use orchestrator::{
    setup_global_fleet, HierarchicalOrchestrator, ListenerId, RegionSummary,
};
pub use tasks::{spawn_snapshot_loop, RunState, ShutdownController};
