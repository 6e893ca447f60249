//! Wire shapes for messages, journals, and snapshot documents.
//!
//! Every type here serializes to the exact JSON layout that the journals and
//! snapshot files expose to external consumers. Field names are part of the
//! contract; renaming one is a wire-format change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hlc::Stamp;
use crate::value::Value;

/// A package-state update in transit between two nodes.
///
/// Immutable once created: the sender stamps it and the receiver only reads
/// it. Carries node ids rather than node handles so the orchestrator resolves
/// endpoints on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Package this update concerns.
    pub package_id: String,
    /// Arbitrary update document.
    pub payload: Value,
    /// Stamp assigned by the sender's clock at send time.
    pub hlc: Stamp,
    /// Sending node id.
    pub src: String,
    /// Destination node id.
    pub dst: String,
    /// Sender-local physical milliseconds when the message was built.
    pub sent_ts: u64,
}

/// Latest applied update for one package as known to one node.
///
/// `hlc` holds only the `(phys, cnt)` pair — serialized as a two-element
/// array — because apply/merge decisions compare by tuple order; the
/// originating node id lives in `node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    /// `(phys, cnt)` of the applied update.
    pub hlc: (u64, u32),
    /// The applied payload.
    pub payload: Value,
    /// Node that originated the applied update.
    pub node: String,
}

/// One line of the delivery journal, appended per completed send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Physical milliseconds at the destination when the message arrived.
    pub arrival_ts: u64,
    /// Sending node id.
    pub src: String,
    /// Destination node id.
    pub dst: String,
    /// Package the delivery concerns.
    pub package_id: String,
    /// Stamp the sender assigned.
    pub hlc: Stamp,
    /// Simulated transit latency.
    pub latency_ms: u64,
    /// Whether the destination applied the update (false = stale).
    pub applied: bool,
    /// Region of the sender.
    pub src_region: String,
    /// Region of the destination.
    pub dst_region: String,
}

/// Direction of a per-node journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
    /// The node emitted the message.
    Send,
    /// The node received the message.
    Recv,
}

/// One line of a node's private event journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLogEntry {
    /// Whether this entry records a send or a receive.
    pub action: NodeAction,
    /// Sending node id.
    pub src: String,
    /// Destination node id.
    pub dst: String,
    /// Stamp carried by the message.
    pub hlc: Stamp,
    /// Package the message concerns.
    pub package_id: String,
    /// The message payload.
    pub payload: Value,
    /// Sender-local physical milliseconds at send.
    pub sent_ts: u64,
    /// Local physical milliseconds when the entry was written (arrival time
    /// for receives, wall time for sends).
    pub arrival_ts: u64,
}

/// An anomaly observed live during delivery, appended to the anomaly journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyRecord {
    /// An HLC physical component diverged from the receiver's wall clock by
    /// more than the configured threshold.
    Drift {
        /// Node at which the divergence was observed.
        node: String,
        /// Absolute divergence in milliseconds.
        drift_ms: u64,
        /// Physical component of the offending stamp.
        hlc_wall: u64,
        /// Receiver wall time at arrival.
        arrival: u64,
    },
    /// A received update carried a stamp older than the stored one.
    OutOfOrder {
        /// Package whose update arrived stale.
        package: String,
        /// `(phys, cnt)` currently stored at the receiver.
        stored_hlc: (u64, u32),
        /// `(phys, cnt)` of the stale arrival.
        received_hlc: (u64, u32),
    },
}

/// An anomaly derived after the fact by scanning a journal.
///
/// Distinct from [`AnomalyRecord`]: these wrap the raw journal records they
/// were derived from, and use the scan-specific `kind` spellings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LogAnomaly {
    /// An adjacent pair regressed in physical time.
    #[serde(rename = "out-of-order")]
    OutOfOrder {
        /// The record at which the regression was observed.
        at: serde_json::Value,
    },
    /// An adjacent pair jumped by more than the drift threshold.
    #[serde(rename = "drift")]
    Drift {
        /// The `[prev, curr]` pair that exhibited the jump.
        between: [serde_json::Value; 2],
    },
}

/// One node's captured contribution to a channel snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Deep copy of the node's package state at capture time.
    pub state: BTreeMap<String, PackageEntry>,
    /// Region the node belongs to.
    pub region: String,
    /// The node's clock reading at capture time.
    pub hlc: Stamp,
}

/// One in-flight message captured on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Sending node id.
    pub from: String,
    /// Destination node id.
    pub to: String,
    /// Package the message concerns.
    pub package_id: String,
    /// Stamp the sender assigned.
    pub hlc: Stamp,
    /// The message payload.
    pub payload: Value,
    /// Sender-local physical milliseconds at send.
    pub sent_ts: u64,
    /// Region of the sender.
    pub src_region: String,
    /// Region of the destination.
    pub dst_region: String,
}

/// A causally consistent global cut: per-node states plus channel contents.
///
/// Captures "after the send, before the receive" on every live channel:
/// senders record in-flight messages before any receiver can clear them, so
/// no update is lost between the node states and the channel list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Captured state per node, keyed by node id.
    pub nodes: BTreeMap<String, NodeSnapshot>,
    /// Messages captured in flight, in deterministic (sender, package) order.
    pub inflight: Vec<ChannelEntry>,
}

/// Differences between two merged global snapshots.
///
/// Each list is sorted lexicographically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Packages present now but not before.
    pub added: Vec<String>,
    /// Packages present in both whose stamp advanced.
    pub updated: Vec<String>,
    /// Packages present before but not now.
    pub removed: Vec<String>,
}
