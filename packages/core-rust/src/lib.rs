//! Courier Core — Hybrid Logical Clock, payload values, wire shapes, and
//! snapshot merging.
//!
//! This crate is the pure-logic foundation of the delivery simulator:
//!
//! - **HLC** ([`hlc`]): monotone causal stamps under physical-clock skew
//! - **Value** ([`value`]): schemaless JSON payload documents
//! - **Record** ([`record`]): message, journal, and snapshot wire shapes
//! - **Snapshot** ([`snapshot`]): deterministic greatest-stamp merging with
//!   node-level and region-level tie-breaking
//!
//! No I/O happens here; journals, nodes, and orchestration live in
//! `courier-sim`.

pub mod hlc;
pub mod record;
pub mod snapshot;
pub mod value;

// HLC
pub use hlc::{ClockSource, OffsetClock, Stamp, SystemClock, HLC};

// Record shapes
pub use record::{
    AnomalyRecord, ChannelEntry, ChannelSnapshot, DeliveryRecord, LogAnomaly, Message, NodeAction,
    NodeLogEntry, NodeSnapshot, PackageEntry, SnapshotDiff,
};

// Snapshot merging
pub use snapshot::{merge_region_snapshots, SnapshotCoordinator};

// Value
pub use value::Value;
