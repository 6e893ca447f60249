//! Snapshot merging with deterministic conflict resolution.
//!
//! A [`SnapshotCoordinator`] collects deep copies of per-node package maps
//! and folds them into a single view, keeping the entry with the greatest
//! `(phys, cnt)` stamp per package. Conflicts on equal stamps resolve by the
//! lexicographically smaller node id — and, for the region-level merge, by
//! the smaller `region:node` composite key — so the merge is commutative,
//! associative over non-conflicting entries, and byte-for-byte reproducible.

use std::collections::{BTreeMap, HashMap};

use crate::record::PackageEntry;

/// Collects per-node state copies and merges them into one map.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use courier_core::record::PackageEntry;
/// use courier_core::snapshot::SnapshotCoordinator;
/// use courier_core::Value;
///
/// let mut coordinator = SnapshotCoordinator::new();
/// let state = HashMap::from([(
///     "pkg1".to_string(),
///     PackageEntry { hlc: (10, 0), payload: Value::Null, node: "A".to_string() },
/// )]);
/// coordinator.record_local("A", &state);
/// assert_eq!(coordinator.merge_snapshots().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SnapshotCoordinator {
    snapshots: BTreeMap<String, HashMap<String, PackageEntry>>,
}

impl SnapshotCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a deep copy of one node's package state.
    ///
    /// Recording the same node again replaces its previous copy; later
    /// mutations of the live node cannot leak into the snapshot.
    pub fn record_local(&mut self, node_id: impl Into<String>, state: &HashMap<String, PackageEntry>) {
        self.snapshots.insert(node_id.into(), state.clone());
    }

    /// Number of node states recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no node state has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Merges all recorded node states into a single package map.
    ///
    /// Per package the entry with the greatest `(phys, cnt)` wins; equal
    /// stamps resolve to the lexicographically smaller originating node id.
    /// The result is independent of recording order.
    #[must_use]
    pub fn merge_snapshots(&self) -> BTreeMap<String, PackageEntry> {
        let mut merged: BTreeMap<String, PackageEntry> = BTreeMap::new();

        for state in self.snapshots.values() {
            for (package_id, entry) in state {
                match merged.get(package_id) {
                    None => {
                        merged.insert(package_id.clone(), entry.clone());
                    }
                    Some(current) if entry_wins(entry, current) => {
                        merged.insert(package_id.clone(), entry.clone());
                    }
                    Some(_) => {}
                }
            }
        }

        merged
    }
}

/// Whether `candidate` replaces `current` under tuple order with the
/// smaller-node-id tie-break.
fn entry_wins(candidate: &PackageEntry, current: &PackageEntry) -> bool {
    match candidate.hlc.cmp(&current.hlc) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate.node < current.node,
    }
}

/// Merges per-region snapshots into one global map.
///
/// Same rule as [`SnapshotCoordinator::merge_snapshots`], except that equal
/// stamps resolve by the smaller `"region:node"` composite key, so two
/// regions reporting the same package at the same stamp always pick the same
/// winner.
#[must_use]
pub fn merge_region_snapshots(
    regions: &BTreeMap<String, BTreeMap<String, PackageEntry>>,
) -> BTreeMap<String, PackageEntry> {
    let mut merged: BTreeMap<String, (String, PackageEntry)> = BTreeMap::new();

    for (region_id, snapshot) in regions {
        for (package_id, entry) in snapshot {
            match merged.get(package_id) {
                None => {
                    merged.insert(package_id.clone(), (region_id.clone(), entry.clone()));
                }
                Some((current_region, current)) => {
                    let replace = match entry.hlc.cmp(&current.hlc) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => {
                            composite_key(region_id, &entry.node)
                                < composite_key(current_region, &current.node)
                        }
                    };
                    if replace {
                        merged.insert(package_id.clone(), (region_id.clone(), entry.clone()));
                    }
                }
            }
        }
    }

    merged
        .into_iter()
        .map(|(package_id, (_, entry))| (package_id, entry))
        .collect()
}

fn composite_key(region: &str, node: &str) -> String {
    format!("{region}:{node}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn entry(phys: u64, cnt: u32, node: &str, status: &str) -> PackageEntry {
        PackageEntry {
            hlc: (phys, cnt),
            payload: Value::object([("s", Value::from(status))]),
            node: node.to_string(),
        }
    }

    fn state(entries: &[(&str, PackageEntry)]) -> HashMap<String, PackageEntry> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    // ---- merge_snapshots ----

    #[test]
    fn greatest_tuple_wins() {
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("A", &state(&[("pkg", entry(100, 0, "A", "SENT"))]));
        coordinator.record_local("B", &state(&[("pkg", entry(200, 0, "B", "DELIVERED"))]));

        let merged = coordinator.merge_snapshots();
        assert_eq!(merged["pkg"], entry(200, 0, "B", "DELIVERED"));
    }

    #[test]
    fn counter_breaks_same_millisecond() {
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("A", &state(&[("pkg", entry(100, 2, "A", "LATER"))]));
        coordinator.record_local("B", &state(&[("pkg", entry(100, 1, "B", "EARLIER"))]));

        let merged = coordinator.merge_snapshots();
        assert_eq!(merged["pkg"].node, "A");
    }

    #[test]
    fn equal_tuple_prefers_smaller_node_id() {
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("n1", &state(&[("pkg", entry(100, 1, "ZZ", "Z-SIDE"))]));
        coordinator.record_local("n2", &state(&[("pkg", entry(100, 1, "AA", "A-SIDE"))]));

        let merged = coordinator.merge_snapshots();
        assert_eq!(merged["pkg"].node, "AA");
    }

    #[test]
    fn disjoint_keys_union() {
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("A", &state(&[("p1", entry(10, 0, "A", "X"))]));
        coordinator.record_local("B", &state(&[("p2", entry(20, 0, "B", "Y"))]));

        let merged = coordinator.merge_snapshots();
        assert_eq!(merged.len(), 2);
        assert!(merged.contains_key("p1"));
        assert!(merged.contains_key("p2"));
    }

    #[test]
    fn recording_same_node_replaces_previous_copy() {
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("A", &state(&[("pkg", entry(10, 0, "A", "OLD"))]));
        coordinator.record_local("A", &state(&[("pkg", entry(20, 0, "A", "NEW"))]));

        let merged = coordinator.merge_snapshots();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["pkg"].hlc, (20, 0));
    }

    #[test]
    fn record_local_is_a_deep_copy() {
        let mut live = state(&[("pkg", entry(10, 0, "A", "SENT"))]);
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("A", &live);

        // Mutate after recording; the snapshot must not see it.
        live.insert("pkg".to_string(), entry(99, 0, "A", "DELIVERED"));

        let merged = coordinator.merge_snapshots();
        assert_eq!(merged["pkg"].hlc, (10, 0));
    }

    #[test]
    fn merge_of_merge_is_identity() {
        let mut coordinator = SnapshotCoordinator::new();
        coordinator.record_local("A", &state(&[("p1", entry(10, 0, "A", "X")), ("p2", entry(30, 1, "A", "Y"))]));
        coordinator.record_local("B", &state(&[("p1", entry(20, 0, "B", "Z"))]));
        let merged = coordinator.merge_snapshots();

        let mut again = SnapshotCoordinator::new();
        again.record_local("all", &merged.clone().into_iter().collect());
        assert_eq!(again.merge_snapshots(), merged);
    }

    #[test]
    fn merge_is_order_independent_and_byte_identical() {
        let a = state(&[("p1", entry(10, 0, "A", "X")), ("p2", entry(5, 3, "A", "Y"))]);
        let b = state(&[("p1", entry(10, 0, "B", "X2")), ("p3", entry(7, 0, "B", "Z"))]);

        let mut forward = SnapshotCoordinator::new();
        forward.record_local("A", &a);
        forward.record_local("B", &b);

        let mut reverse = SnapshotCoordinator::new();
        reverse.record_local("B", &b);
        reverse.record_local("A", &a);

        let bytes_forward = serde_json::to_vec(&forward.merge_snapshots()).expect("serialize");
        let bytes_reverse = serde_json::to_vec(&reverse.merge_snapshots()).expect("serialize");
        assert_eq!(bytes_forward, bytes_reverse);
    }

    // ---- merge_region_snapshots ----

    fn region_map(
        pairs: &[(&str, &[(&str, PackageEntry)])],
    ) -> BTreeMap<String, BTreeMap<String, PackageEntry>> {
        pairs
            .iter()
            .map(|(region, entries)| {
                (
                    (*region).to_string(),
                    entries
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), v.clone()))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn region_merge_greatest_tuple_wins() {
        let regions = region_map(&[
            ("EU", &[("pkg", entry(100, 0, "EU-N1", "OLD"))]),
            ("NA", &[("pkg", entry(200, 0, "NA-N1", "NEW"))]),
        ]);
        let merged = merge_region_snapshots(&regions);
        assert_eq!(merged["pkg"].node, "NA-N1");
    }

    #[test]
    fn region_merge_tie_breaks_on_composite_key() {
        // Identical stamps; "AS:N2" < "EU:N1" so the AS entry must win even
        // though its bare node id sorts after the EU one.
        let regions = region_map(&[
            ("EU", &[("pkgZ", entry(100, 1, "N1", "EU-SIDE"))]),
            ("AS", &[("pkgZ", entry(100, 1, "N2", "AS-SIDE"))]),
        ]);
        let merged = merge_region_snapshots(&regions);
        assert_eq!(merged["pkgZ"].node, "N2");
    }

    #[test]
    fn region_merge_unions_disjoint_regions() {
        let regions = region_map(&[
            ("EU", &[("p1", entry(10, 0, "EU-N1", "A"))]),
            ("NA", &[("p2", entry(20, 0, "NA-N1", "B"))]),
        ]);
        let merged = merge_region_snapshots(&regions);
        assert_eq!(merged.len(), 2);
    }
}
