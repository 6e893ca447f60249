//! Fleet orchestration: registration, delivery, listeners, and snapshots.
//!
//! The orchestrator owns the node registry, the region index, the anomaly
//! detector, and the delivery journal. Each `send` is an independent
//! transaction: stamp at the source, sleep the simulated latency, apply at
//! the destination, run the detector, journal the delivery, and fan out to
//! listeners. Snapshots read every node under the same per-node mutex the
//! delivery path uses, so each captured `(state, inflight, clock)` triple is
//! internally consistent without stopping the world.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;

use courier_core::hlc::{ClockSource, OffsetClock, SystemClock, HLC};
use courier_core::record::{
    ChannelEntry, ChannelSnapshot, DeliveryRecord, NodeSnapshot, PackageEntry, SnapshotDiff,
};
use courier_core::snapshot::{merge_region_snapshots, SnapshotCoordinator};
use courier_core::value::Value;

use crate::config::{SimConfig, CONTINENT_OFFSETS};
use crate::detector::AnomalyDetector;
use crate::error::OrchestratorError;
use crate::journal::{persist_json_atomic, read_json_lines, Journal};
use crate::node::Node;

type SharedNode = Arc<Mutex<Node>>;
type ListenerFn = Arc<dyn Fn(&DeliveryRecord) + Send + Sync>;

/// Handle identifying one listener registration.
///
/// Returned by [`HierarchicalOrchestrator::register_listener`]; passing it to
/// [`HierarchicalOrchestrator::unregister_listener`] removes exactly that
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-region node/package/in-flight counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionSummary {
    /// Number of registered nodes in the region.
    pub nodes: usize,
    /// Total package-state entries across the region's nodes.
    pub packages: usize,
    /// Total in-flight messages across the region's nodes.
    pub inflight: usize,
}

/// Drives a fleet of skewed nodes grouped into regions.
pub struct HierarchicalOrchestrator {
    config: SimConfig,
    nodes: DashMap<String, SharedNode>,
    node_region: DashMap<String, String>,
    regions: RwLock<BTreeMap<String, Vec<String>>>,
    listeners: Mutex<Vec<(ListenerId, ListenerFn)>>,
    next_listener_id: AtomicU64,
    detector: AnomalyDetector,
    deliveries: Journal,
}

impl HierarchicalOrchestrator {
    /// Creates an orchestrator, its log directory, and its journals.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the log directory or a journal cannot be
    /// created.
    pub fn new(config: SimConfig) -> Result<Self, OrchestratorError> {
        std::fs::create_dir_all(&config.log_dir)?;
        let deliveries = Journal::open(config.deliveries_path())?;
        let anomalies = Journal::open(config.anomalies_path())?;
        let detector = AnomalyDetector::new(anomalies, config.drift_threshold_ms);

        Ok(Self {
            config,
            nodes: DashMap::new(),
            node_region: DashMap::new(),
            regions: RwLock::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            detector,
            deliveries,
        })
    }

    /// The configuration this orchestrator was built with.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// The anomaly detector owned by this orchestrator.
    #[must_use]
    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a region. Idempotent.
    pub fn add_region(&self, region_id: &str) {
        self.regions
            .write()
            .entry(region_id.to_string())
            .or_default();
    }

    /// Registers a node in a region with a physical-clock offset.
    ///
    /// The node's clock reads wall time shifted by `offset_ms`, simulating
    /// skew. An unknown region is created on the fly.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::DuplicateNode`] if the id exists (no side
    /// effects), or an I/O error if the node's journal cannot be created.
    pub fn add_node(
        &self,
        node_id: &str,
        region_id: &str,
        offset_ms: i64,
    ) -> Result<(), OrchestratorError> {
        if self.nodes.contains_key(node_id) {
            return Err(OrchestratorError::DuplicateNode {
                id: node_id.to_string(),
            });
        }

        let clock = HLC::new(node_id.to_string(), Box::new(OffsetClock::new(offset_ms)));
        let journal = Journal::open(self.config.node_log_path(node_id))?;
        let node = Node::new(node_id.to_string(), clock, journal);

        self.nodes
            .insert(node_id.to_string(), Arc::new(Mutex::new(node)));
        self.node_region
            .insert(node_id.to_string(), region_id.to_string());
        self.regions
            .write()
            .entry(region_id.to_string())
            .or_default()
            .push(node_id.to_string());

        tracing::debug!(node = node_id, region = region_id, offset_ms, "node registered");
        Ok(())
    }

    /// Registered node ids, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Registered region ids, sorted.
    #[must_use]
    pub fn region_ids(&self) -> Vec<String> {
        self.regions.read().keys().cloned().collect()
    }

    /// The region a node belongs to.
    #[must_use]
    pub fn region_of(&self, node_id: &str) -> Option<String> {
        self.node_region.get(node_id).map(|r| r.clone())
    }

    /// The last applied update a node holds for a package.
    #[must_use]
    pub fn package_state(&self, node_id: &str, package_id: &str) -> Option<PackageEntry> {
        let node = self.shared_node(node_id)?;
        let guard = node.lock();
        guard.state().get(package_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Executes one delivery from `src` to `dst` with simulated latency.
    ///
    /// Blocks for the latency (supplied, or uniform in the configured
    /// range), then applies the message at the destination, runs the drift
    /// check — and the out-of-order check when the update was stale — and
    /// journals a [`DeliveryRecord`] that is also fanned out to listeners.
    /// Journal, detector, and listener failures never fail the send.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::UnknownNode`] if either endpoint is not
    /// registered; in that case nothing is stamped, journalled, or slept.
    pub fn send(
        &self,
        src: &str,
        dst: &str,
        package_id: &str,
        payload: Value,
        simulate_latency_ms: Option<u64>,
    ) -> Result<DeliveryRecord, OrchestratorError> {
        let src_node = self
            .shared_node(src)
            .ok_or_else(|| OrchestratorError::UnknownNode { id: src.to_string() })?;
        let dst_node = self
            .shared_node(dst)
            .ok_or_else(|| OrchestratorError::UnknownNode { id: dst.to_string() })?;

        let send_pt = SystemClock.now_ms();
        let message = src_node.lock().send(package_id, payload, dst, Some(send_pt));

        let latency_ms = simulate_latency_ms.unwrap_or_else(|| {
            rand::rng().random_range(self.config.latency_min_ms..=self.config.latency_max_ms)
        });
        std::thread::sleep(Duration::from_millis(latency_ms));

        let arrival_ts = SystemClock.now_ms();
        let (applied, stored_hlc) = {
            let mut guard = dst_node.lock();
            let applied = guard.receive(&message, arrival_ts);
            // On a stale arrival the stored entry is the newer one that beat it.
            let stored_hlc = if applied {
                None
            } else {
                guard.state().get(package_id).map(|entry| entry.hlc)
            };
            (applied, stored_hlc)
        };

        self.detector.check_drift(dst, message.hlc.phys, arrival_ts);
        if let Some(stored) = stored_hlc {
            self.detector
                .check_out_of_order(stored, message.hlc.tuple(), package_id);
        }

        let record = DeliveryRecord {
            arrival_ts,
            src: src.to_string(),
            dst: dst.to_string(),
            package_id: package_id.to_string(),
            hlc: message.hlc.clone(),
            latency_ms,
            applied,
            src_region: self.region_of(src).unwrap_or_default(),
            dst_region: self.region_of(dst).unwrap_or_default(),
        };

        self.deliveries.append_best_effort(&record);
        self.notify_listeners(&record);

        tracing::debug!(
            src,
            dst,
            package = package_id,
            latency_ms,
            applied,
            "delivery complete"
        );
        Ok(record)
    }

    /// Reads the tail of the delivery journal.
    ///
    /// Unparseable lines are skipped; at most `limit` records are returned,
    /// most recent last.
    #[must_use]
    pub fn recent_deliveries(&self, limit: usize) -> Vec<DeliveryRecord> {
        let records = read_json_lines(&self.config.deliveries_path()).unwrap_or_default();
        let parsed: Vec<DeliveryRecord> = records
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        let skip = parsed.len().saturating_sub(limit);
        parsed.into_iter().skip(skip).collect()
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Registers a delivery listener, returning its handle.
    ///
    /// The callback receives every subsequent [`DeliveryRecord`]. Panics
    /// inside a callback are caught per listener and dropped.
    pub fn register_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DeliveryRecord) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener registration. Returns whether it was present.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    fn notify_listeners(&self, record: &DeliveryRecord) {
        // Snapshot the list so a slow callback never holds the lock.
        let listeners: Vec<(ListenerId, ListenerFn)> = self.listeners.lock().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(record))).is_err() {
                metrics::counter!("courier_listener_failures_total").increment(1);
                tracing::warn!(listener = id.0, "delivery listener panicked; dropped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Captures a causally consistent global cut with channel contents.
    ///
    /// For every node (in sorted order) the state, region, and clock reading
    /// are copied under the node's own lock, and each in-flight message
    /// becomes a channel entry. Because senders record in-flight messages
    /// before any receiver can clear them, the cut lands "after the send,
    /// before the receive" on every live channel. The document persists
    /// atomically under the channel-snapshot filename.
    pub fn channel_snapshot(&self) -> ChannelSnapshot {
        let mut nodes = BTreeMap::new();
        let mut inflight = Vec::new();

        for node_id in self.node_ids() {
            let Some(node) = self.shared_node(&node_id) else {
                continue;
            };
            let guard = node.lock();

            let state: BTreeMap<String, PackageEntry> = guard
                .state()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            nodes.insert(
                node_id.clone(),
                NodeSnapshot {
                    state,
                    region: self.region_of(&node_id).unwrap_or_default(),
                    hlc: guard.clock().last_stamp(),
                },
            );

            let mut pending: Vec<_> = guard.inflight().values().cloned().collect();
            pending.sort_by(|a, b| a.package_id.cmp(&b.package_id));
            for message in pending {
                inflight.push(ChannelEntry {
                    src_region: self.region_of(&message.src).unwrap_or_default(),
                    dst_region: self.region_of(&message.dst).unwrap_or_default(),
                    from: message.src,
                    to: message.dst,
                    package_id: message.package_id,
                    hlc: message.hlc,
                    payload: message.payload,
                    sent_ts: message.sent_ts,
                });
            }
        }

        let snapshot = ChannelSnapshot { nodes, inflight };
        self.persist_best_effort(&self.config.channel_snapshot_path(), &snapshot);
        tracing::info!(
            nodes = snapshot.nodes.len(),
            inflight = snapshot.inflight.len(),
            "channel snapshot captured"
        );
        snapshot
    }

    /// Merges one region's node states into a single map and persists it.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::UnknownRegion`] if the region is not registered.
    pub fn region_snapshot(
        &self,
        region_id: &str,
    ) -> Result<BTreeMap<String, PackageEntry>, OrchestratorError> {
        let members = self
            .regions
            .read()
            .get(region_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownRegion { id: region_id.to_string() })?;

        Ok(self.region_snapshot_of(region_id, &members))
    }

    /// Region snapshot for every region, merged with the region-aware
    /// tie-break, persisted under the merged-snapshot filename.
    #[must_use]
    pub fn hierarchical_snapshot(&self) -> BTreeMap<String, PackageEntry> {
        let regions: BTreeMap<String, Vec<String>> = self.regions.read().clone();

        let region_maps: BTreeMap<String, BTreeMap<String, PackageEntry>> = regions
            .iter()
            .map(|(region_id, members)| {
                (region_id.clone(), self.region_snapshot_of(region_id, members))
            })
            .collect();

        let merged = merge_region_snapshots(&region_maps);
        self.persist_best_effort(&self.config.merged_snapshot_path(), &merged);
        tracing::info!(
            regions = region_maps.len(),
            packages = merged.len(),
            "hierarchical snapshot merged"
        );
        merged
    }

    /// Takes a hierarchical snapshot and diffs it against the previous one.
    ///
    /// The prior document is read from the merged-snapshot file; if it is
    /// missing or unreadable every package counts as added. The diff
    /// persists under the diff filename and each list is sorted.
    #[must_use]
    pub fn snapshot_and_diff(&self) -> (BTreeMap<String, PackageEntry>, SnapshotDiff) {
        let previous: Option<BTreeMap<String, PackageEntry>> =
            std::fs::read(self.config.merged_snapshot_path())
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        let merged = self.hierarchical_snapshot();

        let mut diff = SnapshotDiff::default();
        match previous {
            None => diff.added = merged.keys().cloned().collect(),
            Some(previous) => {
                diff.added = merged
                    .keys()
                    .filter(|k| !previous.contains_key(*k))
                    .cloned()
                    .collect();
                diff.removed = previous
                    .keys()
                    .filter(|k| !merged.contains_key(*k))
                    .cloned()
                    .collect();
                diff.updated = merged
                    .iter()
                    .filter(|(k, entry)| {
                        previous.get(*k).is_some_and(|old| entry.hlc > old.hlc)
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
            }
        }

        self.persist_best_effort(&self.config.diff_path(), &diff);
        (merged, diff)
    }

    /// Per-region node/package/in-flight counts.
    #[must_use]
    pub fn region_summaries(&self) -> BTreeMap<String, RegionSummary> {
        let regions: BTreeMap<String, Vec<String>> = self.regions.read().clone();

        regions
            .into_iter()
            .map(|(region_id, members)| {
                let mut packages = 0;
                let mut inflight = 0;
                for member in &members {
                    if let Some(node) = self.shared_node(member) {
                        let guard = node.lock();
                        packages += guard.state().len();
                        inflight += guard.inflight().len();
                    }
                }
                (
                    region_id,
                    RegionSummary { nodes: members.len(), packages, inflight },
                )
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn shared_node(&self, node_id: &str) -> Option<SharedNode> {
        self.nodes.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    fn region_snapshot_of(
        &self,
        region_id: &str,
        members: &[String],
    ) -> BTreeMap<String, PackageEntry> {
        let mut coordinator = SnapshotCoordinator::new();
        for member in members {
            if let Some(node) = self.shared_node(member) {
                let guard = node.lock();
                coordinator.record_local(member.clone(), guard.state());
            }
        }

        let merged = coordinator.merge_snapshots();
        self.persist_best_effort(&self.config.region_snapshot_path(region_id), &merged);
        merged
    }

    fn persist_best_effort<T: Serialize>(&self, path: &Path, value: &T) {
        if let Err(err) = persist_json_atomic(path, value) {
            metrics::counter!("courier_snapshot_persist_failures_total").increment(1);
            tracing::warn!(path = %path.display(), %err, "snapshot persist failed");
        }
    }
}

/// Builds the default seven-continent fleet.
///
/// Each continent becomes a region holding `nodes_per_region` nodes named
/// `"{continent}-N{i}"`, skewed by the continent offset plus 10 ms per node
/// index so no two clocks agree exactly.
///
/// # Errors
///
/// Propagates [`HierarchicalOrchestrator::add_node`] failures.
pub fn setup_global_fleet(
    orchestrator: &HierarchicalOrchestrator,
    nodes_per_region: usize,
) -> Result<(), OrchestratorError> {
    for (continent, offset) in CONTINENT_OFFSETS {
        orchestrator.add_region(continent);
        for i in 1..=nodes_per_region {
            let node_id = format!("{continent}-N{i}");
            let skew = offset + i64::try_from(i).unwrap_or(i64::MAX).saturating_mul(10);
            orchestrator.add_node(&node_id, continent, skew)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use super::*;

    fn make_orchestrator() -> (Arc<HierarchicalOrchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SimConfig::with_log_dir(dir.path());
        let orchestrator = HierarchicalOrchestrator::new(config).expect("orchestrator");
        (Arc::new(orchestrator), dir)
    }

    fn status(s: &str) -> Value {
        Value::object([("s", Value::from(s))])
    }

    // ---- Registration ----

    #[test]
    fn add_region_is_idempotent() {
        let (orch, _dir) = make_orchestrator();
        orch.add_region("EU");
        orch.add_region("EU");
        assert_eq!(orch.region_ids(), vec!["EU".to_string()]);
    }

    #[test]
    fn add_node_creates_region_and_journal() {
        let (orch, dir) = make_orchestrator();
        orch.add_node("EU-N1", "EU", 5_000).expect("add");

        assert_eq!(orch.region_of("EU-N1"), Some("EU".to_string()));
        assert_eq!(orch.region_ids(), vec!["EU".to_string()]);
        assert!(dir.path().join("EU-N1.log").exists());
    }

    #[test]
    fn add_node_rejects_duplicate_id() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");

        let err = orch.add_node("A", "EU", 0).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateNode { .. }));
        // Region membership untouched by the failed call.
        assert_eq!(orch.region_of("A"), Some("NA".to_string()));
    }

    #[test]
    fn global_fleet_setup_builds_seven_regions() {
        let (orch, _dir) = make_orchestrator();
        setup_global_fleet(&orch, 3).expect("setup");

        assert_eq!(orch.region_ids().len(), 7);
        assert_eq!(orch.node_ids().len(), 21);
        assert_eq!(orch.region_of("AN-N2"), Some("AN".to_string()));
    }

    // ---- Delivery ----

    #[test]
    fn send_unknown_node_fails_without_side_effects() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");

        let err = orch
            .send("A", "ghost", "pkg1", status("SENT"), Some(0))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownNode { .. }));

        // Nothing journalled, nothing stamped into A's state.
        assert!(orch.recent_deliveries(10).is_empty());
        assert!(orch.package_state("A", "pkg1").is_none());
    }

    #[test]
    fn send_applies_and_journals_delivery() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "EU", 0).expect("add");

        let record = orch
            .send("A", "B", "pkg1", status("SENT"), Some(0))
            .expect("send");

        assert!(record.applied);
        assert_eq!(record.src_region, "NA");
        assert_eq!(record.dst_region, "EU");
        assert_eq!(record.latency_ms, 0);
        assert_eq!(record.hlc.node, "A");

        let journalled = orch.recent_deliveries(10);
        assert_eq!(journalled.len(), 1);
        assert_eq!(journalled[0], record);

        let entry = orch.package_state("B", "pkg1").expect("state");
        assert_eq!(entry.node, "A");
        assert_eq!(entry.payload, status("SENT"));
    }

    #[test]
    fn recent_deliveries_respects_limit() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");

        for i in 0..5 {
            orch.send("A", "B", &format!("pkg{i}"), status("SENT"), Some(0))
                .expect("send");
        }

        let tail = orch.recent_deliveries(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].package_id, "pkg3");
        assert_eq!(tail[1].package_id, "pkg4");
    }

    #[test]
    fn stale_send_records_applied_false_and_anomalies() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");
        // 15 seconds behind wall time.
        orch.add_node("STALE", "NA", -15_000).expect("add");

        let fresh = orch
            .send("A", "B", "pkg1", status("DELIVERED"), Some(0))
            .expect("send");
        assert!(fresh.applied);

        let stale = orch
            .send("STALE", "B", "pkg1", status("SENT"), Some(0))
            .expect("send");
        assert!(!stale.applied);
        assert!(stale.hlc < fresh.hlc);

        // The newer update survives at B.
        let entry = orch.package_state("B", "pkg1").expect("state");
        assert_eq!(entry.payload, status("DELIVERED"));

        // Both anomaly kinds were journalled.
        let anomalies = read_json_lines(orch.detector().journal_path()).expect("read");
        let kinds: Vec<&str> = anomalies
            .iter()
            .filter_map(|a| a.get("kind").and_then(serde_json::Value::as_str))
            .collect();
        assert!(kinds.contains(&"drift"));
        assert!(kinds.contains(&"out_of_order"));
    }

    // ---- Listeners ----

    #[test]
    fn listeners_receive_each_delivery() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let id = orch.register_listener(move |record| {
            assert_eq!(record.package_id, "pkg1");
            seen_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });

        orch.send("A", "B", "pkg1", status("SENT"), Some(0)).expect("send");
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);

        assert!(orch.unregister_listener(id));
        orch.send("A", "B", "pkg1", status("SENT"), Some(0)).expect("send");
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);

        // Second unregister is a no-op.
        assert!(!orch.unregister_listener(id));
    }

    #[test]
    fn panicking_listener_does_not_fail_send() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        orch.register_listener(|_| panic!("listener bug"));
        orch.register_listener(move |_| {
            seen_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });

        let record = orch
            .send("A", "B", "pkg1", status("SENT"), Some(0))
            .expect("send");
        assert!(record.applied);
        // The healthy listener still ran.
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
    }

    // ---- Snapshots ----

    #[test]
    fn channel_snapshot_captures_inflight_message() {
        let (orch, dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "EU", 0).expect("add");

        // Stage a send without delivering it: the message is in flight.
        let node_a = orch.shared_node("A").expect("node");
        node_a.lock().send("pkg1", status("SENT"), "B", None);

        let snapshot = orch.channel_snapshot();

        assert_eq!(snapshot.inflight.len(), 1);
        let entry = &snapshot.inflight[0];
        assert_eq!(entry.from, "A");
        assert_eq!(entry.to, "B");
        assert_eq!(entry.package_id, "pkg1");
        assert_eq!(entry.src_region, "NA");
        assert_eq!(entry.dst_region, "EU");

        // The destination has not applied the package.
        assert!(!snapshot.nodes["B"].state.contains_key("pkg1"));
        // The sender applied it optimistically.
        assert!(snapshot.nodes["A"].state.contains_key("pkg1"));

        assert!(dir.path().join("channel_snapshot.json").exists());
    }

    #[test]
    fn channel_snapshot_inflight_resolves_known_endpoints() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");

        let node_a = orch.shared_node("A").expect("node");
        node_a.lock().send("p1", Value::Null, "B", None);
        node_a.lock().send("p2", Value::Null, "B", None);

        let snapshot = orch.channel_snapshot();
        for entry in &snapshot.inflight {
            assert!(snapshot.nodes.contains_key(&entry.from));
            assert!(snapshot.nodes.contains_key(&entry.to));
            // The destination holds no version at or past the in-flight one.
            let dst_state = &snapshot.nodes[&entry.to].state;
            assert!(dst_state
                .get(&entry.package_id)
                .is_none_or(|stored| stored.hlc < entry.hlc.tuple()));
        }
    }

    #[test]
    fn delivered_package_leaves_no_inflight_entry() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");

        orch.send("A", "B", "pkg1", status("SENT"), Some(0)).expect("send");
        let snapshot = orch.channel_snapshot();
        assert!(snapshot.inflight.is_empty());
    }

    #[test]
    fn region_snapshot_unknown_region_fails() {
        let (orch, _dir) = make_orchestrator();
        let err = orch.region_snapshot("nowhere").unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownRegion { .. }));
    }

    #[test]
    fn region_snapshot_merges_members_and_persists() {
        let (orch, dir) = make_orchestrator();
        orch.add_node("EU-N1", "EU", 0).expect("add");
        orch.add_node("EU-N2", "EU", 0).expect("add");
        orch.add_node("NA-N1", "NA", 0).expect("add");

        orch.send("EU-N1", "EU-N2", "pkg1", status("SENT"), Some(0)).expect("send");
        orch.send("NA-N1", "EU-N1", "pkg2", status("SENT"), Some(0)).expect("send");

        let merged = orch.region_snapshot("EU").expect("snapshot");
        // pkg1 known to both EU nodes, pkg2 applied at EU-N1.
        assert!(merged.contains_key("pkg1"));
        assert!(merged.contains_key("pkg2"));
        assert!(dir.path().join("region_EU_snapshot.json").exists());
    }

    #[test]
    fn hierarchical_snapshot_spans_regions() {
        let (orch, dir) = make_orchestrator();
        orch.add_node("EU-N1", "EU", 0).expect("add");
        orch.add_node("NA-N1", "NA", 0).expect("add");

        orch.send("EU-N1", "NA-N1", "pkg1", status("SENT"), Some(0)).expect("send");

        let merged = orch.hierarchical_snapshot();
        assert!(merged.contains_key("pkg1"));
        assert!(dir.path().join("global_snapshot.json").exists());
        // Distinct from the channel snapshot file.
        assert!(!dir.path().join("channel_snapshot.json").exists());
    }

    #[test]
    fn snapshot_and_diff_tracks_added_then_updated() {
        let (orch, dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "NA", 0).expect("add");

        orch.send("A", "B", "pkg1", status("SENT"), Some(0)).expect("send");
        let (_, first) = orch.snapshot_and_diff();
        assert_eq!(first.added, vec!["pkg1".to_string()]);
        assert!(first.updated.is_empty());
        assert!(first.removed.is_empty());

        orch.send("A", "B", "pkg1", status("DELIVERED"), Some(0)).expect("send");
        orch.send("A", "B", "pkg2", status("SENT"), Some(0)).expect("send");
        let (merged, second) = orch.snapshot_and_diff();

        assert_eq!(second.added, vec!["pkg2".to_string()]);
        assert_eq!(second.updated, vec!["pkg1".to_string()]);
        assert!(second.removed.is_empty());
        assert_eq!(merged["pkg1"].payload, status("DELIVERED"));
        assert!(dir.path().join("snapshot_diff.json").exists());
    }

    #[test]
    fn merged_snapshot_document_is_reproducible() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("A", "NA", 0).expect("add");
        orch.add_node("B", "EU", 0).expect("add");
        orch.send("A", "B", "pkg1", status("SENT"), Some(0)).expect("send");

        let first = serde_json::to_vec(&orch.hierarchical_snapshot()).expect("serialize");
        let second = serde_json::to_vec(&orch.hierarchical_snapshot()).expect("serialize");
        assert_eq!(first, second);
    }

    // ---- Summaries ----

    #[test]
    fn region_summaries_count_nodes_packages_inflight() {
        let (orch, _dir) = make_orchestrator();
        orch.add_node("EU-N1", "EU", 0).expect("add");
        orch.add_node("EU-N2", "EU", 0).expect("add");
        orch.add_node("NA-N1", "NA", 0).expect("add");

        orch.send("EU-N1", "EU-N2", "pkg1", status("SENT"), Some(0)).expect("send");
        let node = orch.shared_node("NA-N1").expect("node");
        node.lock().send("pkg2", status("SENT"), "EU-N1", None);

        let summaries = orch.region_summaries();
        assert_eq!(summaries["EU"].nodes, 2);
        // Sender and receiver both know pkg1.
        assert_eq!(summaries["EU"].packages, 2);
        assert_eq!(summaries["EU"].inflight, 0);
        assert_eq!(summaries["NA"].nodes, 1);
        assert_eq!(summaries["NA"].inflight, 1);
    }
}
