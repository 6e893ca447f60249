//! Timing-anomaly detection over deliveries and journals.
//!
//! Two live checks run inside the delivery path — physical-clock drift and
//! out-of-order arrival — and append [`AnomalyRecord`]s to the anomaly
//! journal. Two offline operations scan an existing journal for adjacency
//! anomalies and tally drift counts per node. Everything here is best-effort
//! from the orchestrator's point of view: a failed append or an unreadable
//! line never fails the owning send.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use courier_core::record::{AnomalyRecord, LogAnomaly};

use crate::journal::{read_json_lines, Journal};

/// Stateless evaluator that classifies timing anomalies.
pub struct AnomalyDetector {
    drift_threshold_ms: u64,
    journal: Journal,
}

impl AnomalyDetector {
    /// Creates a detector writing to the given anomaly journal.
    #[must_use]
    pub fn new(journal: Journal, drift_threshold_ms: u64) -> Self {
        Self {
            drift_threshold_ms,
            journal,
        }
    }

    /// The configured drift threshold in milliseconds.
    #[must_use]
    pub fn drift_threshold_ms(&self) -> u64 {
        self.drift_threshold_ms
    }

    /// Path of the anomaly journal this detector appends to.
    #[must_use]
    pub fn journal_path(&self) -> &Path {
        self.journal.path()
    }

    /// Flags divergence between a stamp's physical component and the
    /// receiver's wall time at arrival.
    ///
    /// A delta exactly equal to the threshold does not flag; only strictly
    /// greater deltas do. Flagged anomalies are journalled best-effort and
    /// returned.
    pub fn check_drift(
        &self,
        node_id: &str,
        hlc_phys: u64,
        arrival_phys: u64,
    ) -> Option<AnomalyRecord> {
        let drift_ms = hlc_phys.abs_diff(arrival_phys);
        if drift_ms <= self.drift_threshold_ms {
            return None;
        }

        let record = AnomalyRecord::Drift {
            node: node_id.to_string(),
            drift_ms,
            hlc_wall: hlc_phys,
            arrival: arrival_phys,
        };
        self.journal.append_best_effort(&record);
        Some(record)
    }

    /// Flags an arrival whose stamp is older than the stored one.
    ///
    /// Compares `(phys, cnt)` tuples; the caller supplies the stored stamp
    /// it found at the destination. Flagged anomalies are journalled
    /// best-effort and returned.
    pub fn check_out_of_order(
        &self,
        stored_hlc: (u64, u32),
        received_hlc: (u64, u32),
        package_id: &str,
    ) -> Option<AnomalyRecord> {
        if received_hlc >= stored_hlc {
            return None;
        }

        let record = AnomalyRecord::OutOfOrder {
            package: package_id.to_string(),
            stored_hlc,
            received_hlc,
        };
        self.journal.append_best_effort(&record);
        Some(record)
    }

    /// Scans a JSON-lines journal for adjacency anomalies.
    ///
    /// Takes an explicit path because the check is meaningful on more than
    /// one journal (see [`scan_anomaly_journal`](Self::scan_anomaly_journal)
    /// and [`scan_delivery_journal`](Self::scan_delivery_journal)). Records
    /// with a parseable `hlc` object or `ts` pair are sorted by `(phys, cnt)`
    /// ascending; each adjacent pair is flagged `out-of-order` on a physical
    /// regression and `drift` on a super-threshold physical jump. Everything
    /// else is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the journal exists but cannot be opened.
    pub fn scan_journal(&self, path: &Path) -> io::Result<Vec<LogAnomaly>> {
        let records = read_json_lines(path)?;

        let mut stamped: Vec<((u64, u32), serde_json::Value)> = records
            .into_iter()
            .filter_map(|record| stamp_tuple(&record).map(|tuple| (tuple, record)))
            .collect();
        stamped.sort_by_key(|(tuple, _)| *tuple);

        let mut anomalies = Vec::new();
        for pair in stamped.windows(2) {
            let (prev_tuple, prev) = &pair[0];
            let (curr_tuple, curr) = &pair[1];

            if curr_tuple.0 < prev_tuple.0 {
                anomalies.push(LogAnomaly::OutOfOrder { at: curr.clone() });
            }
            if curr_tuple.0.abs_diff(prev_tuple.0) > self.drift_threshold_ms {
                anomalies.push(LogAnomaly::Drift {
                    between: [prev.clone(), curr.clone()],
                });
            }
        }
        Ok(anomalies)
    }

    /// Adjacency scan over this detector's own anomaly journal.
    ///
    /// # Errors
    ///
    /// See [`scan_journal`](Self::scan_journal).
    pub fn scan_anomaly_journal(&self) -> io::Result<Vec<LogAnomaly>> {
        self.scan_journal(self.journal.path())
    }

    /// Adjacency scan over a delivery journal.
    ///
    /// # Errors
    ///
    /// See [`scan_journal`](Self::scan_journal).
    pub fn scan_delivery_journal(&self, deliveries: &Path) -> io::Result<Vec<LogAnomaly>> {
        self.scan_journal(deliveries)
    }

    /// Tallies journalled drift anomalies per node.
    ///
    /// Unreadable lines and non-drift records are skipped.
    #[must_use]
    pub fn summarize_drifts(&self) -> HashMap<String, u64> {
        let records = read_json_lines(self.journal.path()).unwrap_or_default();

        let mut summary: HashMap<String, u64> = HashMap::new();
        for record in records {
            if record.get("kind").and_then(serde_json::Value::as_str) != Some("drift") {
                continue;
            }
            let Some(node) = record.get("node").and_then(serde_json::Value::as_str) else {
                continue;
            };
            *summary.entry(node.to_string()).or_insert(0) += 1;
        }
        summary
    }
}

/// Extracts the `(phys, cnt)` pair from a journal record.
///
/// Accepts the `hlc` object shape (`{"phys": .., "cnt": ..}`), an `hlc`
/// pair (`[phys, cnt]`), or the legacy `ts` pair.
fn stamp_tuple(record: &serde_json::Value) -> Option<(u64, u32)> {
    let stamp = record.get("hlc").or_else(|| record.get("ts"))?;

    if let Some(object) = stamp.as_object() {
        let phys = object.get("phys")?.as_u64()?;
        let cnt = u32::try_from(object.get("cnt")?.as_u64()?).ok()?;
        return Some((phys, cnt));
    }

    if let Some(pair) = stamp.as_array() {
        let phys = pair.first()?.as_u64()?;
        let cnt = u32::try_from(pair.get(1)?.as_u64()?).ok()?;
        return Some((phys, cnt));
    }

    None
}
