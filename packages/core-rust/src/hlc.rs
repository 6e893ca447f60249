//! Hybrid Logical Clock (HLC) for causal ordering of delivery events.
//!
//! Provides monotonically increasing stamps that combine physical wall-clock
//! milliseconds with a logical counter, so events stay totally ordered even
//! when a node's physical clock stalls or steps backward. The HLC is the
//! foundation for last-write-wins package-state merging and for snapshot
//! conflict resolution.
//!
//! # Wire format
//!
//! A stamp serializes as the JSON object `{"phys": .., "cnt": .., "node": ..}`,
//! matching the delivery and per-node journal shapes.

use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical stamp combining physical time, logical counter, and node identity.
///
/// Ordering is defined as: `phys` first, then `cnt`, then `node` (lexicographic
/// byte order). Two stamps produced by different nodes in the same millisecond
/// with the same counter are still totally ordered by node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Physical wall-clock milliseconds since Unix epoch.
    pub phys: u64,
    /// Logical counter for events within the same millisecond.
    pub cnt: u32,
    /// Identifier of the node that generated this stamp.
    pub node: String,
}

impl Stamp {
    /// Returns the `(phys, cnt)` pair used for tuple-order comparisons.
    ///
    /// Package state and snapshot merging compare by this pair alone; the
    /// node id only participates in deterministic tie-breaking.
    #[must_use]
    pub fn tuple(&self) -> (u64, u32) {
        (self.phys, self.cnt)
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.phys
            .cmp(&other.phys)
            .then_with(|| self.cnt.cmp(&other.cnt))
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.phys, self.cnt, self.node)
    }
}

/// Abstraction over the physical clock for dependency injection.
///
/// Allows deterministic testing and skew simulation by replacing the real
/// clock. The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`; [`OffsetClock`] shifts it by a fixed amount.
pub trait ClockSource: Send + Sync {
    /// Returns the current physical time as milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as u64
    }
}

/// Clock source that reads the system time shifted by a fixed signed offset.
///
/// Used to simulate per-node physical-clock skew (e.g. a continent whose
/// clocks run seconds ahead). A negative offset that would underflow the
/// epoch clamps to zero.
#[derive(Debug, Clone)]
pub struct OffsetClock {
    offset_ms: i64,
}

impl OffsetClock {
    /// Creates a clock source shifted by `offset_ms` milliseconds.
    #[must_use]
    pub fn new(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    /// Returns the configured offset.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }
}

impl ClockSource for OffsetClock {
    #[allow(clippy::cast_possible_wrap)]
    fn now_ms(&self) -> u64 {
        let wall = SystemClock.now_ms() as i64;
        u64::try_from(wall.saturating_add(self.offset_ms)).unwrap_or(0)
    }
}

/// Hybrid Logical Clock.
///
/// Generates monotonically increasing [`Stamp`]s by combining the injected
/// physical time with a logical counter. When the physical clock advances,
/// the counter resets to 0. When the physical clock is unchanged or behind
/// (skew), the counter increments.
///
/// # Examples
///
/// ```
/// use courier_core::hlc::{SystemClock, HLC};
///
/// let mut hlc = HLC::new("node-1".to_string(), Box::new(SystemClock));
/// let a = hlc.now();
/// let b = hlc.now();
/// assert!(a < b);
/// ```
pub struct HLC {
    last_phys: u64,
    last_cnt: u32,
    node_id: String,
    source: Box<dyn ClockSource>,
}

impl HLC {
    /// Creates a new HLC with the given node id and clock source.
    #[must_use]
    pub fn new(node_id: String, source: Box<dyn ClockSource>) -> Self {
        Self {
            last_phys: 0,
            last_cnt: 0,
            node_id,
            source,
        }
    }

    /// Returns the node id stamped onto every value this clock produces.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns a reference to the physical-time source.
    pub fn source(&self) -> &dyn ClockSource {
        &*self.source
    }

    /// Generates a new unique stamp for a local event.
    ///
    /// Always strictly greater than any stamp previously generated or merged
    /// by this clock. If physical time advanced past the last logical time,
    /// the counter resets to 0; otherwise it increments.
    pub fn now(&mut self) -> Stamp {
        let phys = self.source.now_ms();

        if phys > self.last_phys {
            self.last_phys = phys;
            self.last_cnt = 0;
        } else {
            // Physical time stood still or went backward (skew).
            self.last_cnt += 1;
        }

        self.stamp()
    }

    /// Merges a received remote stamp into the local clock state.
    ///
    /// Must be called whenever a message is received from another node. The
    /// returned stamp is strictly greater than both the previous local stamp
    /// and `remote`, which keeps causally related events totally ordered.
    pub fn merge(&mut self, remote: &Stamp) -> Stamp {
        let phys = self.source.now_ms();
        let max_phys = phys.max(self.last_phys).max(remote.phys);

        let cnt = if max_phys == phys && phys > self.last_phys.max(remote.phys) {
            // Local wall time is strictly ahead of both logical clocks.
            0
        } else if max_phys == self.last_phys && self.last_phys > phys.max(remote.phys) {
            // Local logical clock is strictly ahead.
            self.last_cnt + 1
        } else if max_phys == remote.phys && remote.phys > phys.max(self.last_phys) {
            // Remote clock is strictly ahead: fast-forward past it.
            remote.cnt + 1
        } else {
            // Two or more clocks share the maximum millisecond.
            self.last_cnt.max(remote.cnt) + 1
        };

        self.last_phys = max_phys;
        self.last_cnt = cnt;
        self.stamp()
    }

    /// Returns the clock's current position without advancing it.
    ///
    /// Used by snapshots to capture an opaque clock reading that stays
    /// consistent with the state captured under the same lock.
    #[must_use]
    pub fn last_stamp(&self) -> Stamp {
        self.stamp()
    }

    fn stamp(&self) -> Stamp {
        Stamp {
            phys: self.last_phys,
            cnt: self.last_cnt,
            node: self.node_id.clone(),
        }
    }
}
