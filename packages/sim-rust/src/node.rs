//! A fleet participant: clock, package state, and in-flight tracking.
//!
//! A node owns its HLC, the last applied update per package, and the set of
//! messages it has sent but not yet seen received. `send`/`receive` follow
//! last-write-wins discipline: an update applies only if its stamp is
//! strictly greater (tuple order) than the stored one, and the clock always
//! merges received stamps so causality survives even rejected updates.

use std::collections::HashMap;

use courier_core::hlc::{ClockSource, Stamp, SystemClock, HLC};
use courier_core::record::{Message, NodeAction, NodeLogEntry, PackageEntry};
use courier_core::value::Value;

use crate::journal::Journal;

/// One participant in the delivery fleet.
pub struct Node {
    id: String,
    clock: HLC,
    state: HashMap<String, PackageEntry>,
    inflight: HashMap<String, Message>,
    journal: Journal,
}

impl Node {
    /// Creates a node with the given clock and private event journal.
    #[must_use]
    pub fn new(id: String, clock: HLC, journal: Journal) -> Self {
        Self {
            id,
            clock,
            state: HashMap::new(),
            inflight: HashMap::new(),
            journal,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node's clock (read-only; snapshots use [`HLC::last_stamp`]).
    #[must_use]
    pub fn clock(&self) -> &HLC {
        &self.clock
    }

    /// Last applied update per package.
    #[must_use]
    pub fn state(&self) -> &HashMap<String, PackageEntry> {
        &self.state
    }

    /// Messages sent but not yet observed as received.
    #[must_use]
    pub fn inflight(&self) -> &HashMap<String, Message> {
        &self.inflight
    }

    /// Stamps a local event.
    pub fn stamp_event(&mut self) -> Stamp {
        self.clock.now()
    }

    /// Builds and emits an update message for `package_id` addressed to `dst`.
    ///
    /// The local state is updated optimistically (the sender trusts its own
    /// update) and the message is tracked as in flight until a receive for
    /// the same package comes back. The journal write is best-effort.
    pub fn send(
        &mut self,
        package_id: &str,
        payload: Value,
        dst: &str,
        sent_ts: Option<u64>,
    ) -> Message {
        let hlc = self.stamp_event();
        let sent_ts = sent_ts.unwrap_or_else(|| SystemClock.now_ms());

        let message = Message {
            package_id: package_id.to_string(),
            payload: payload.clone(),
            hlc: hlc.clone(),
            src: self.id.clone(),
            dst: dst.to_string(),
            sent_ts,
        };

        self.log_event(NodeAction::Send, &message, SystemClock.now_ms());

        self.state.insert(
            package_id.to_string(),
            PackageEntry {
                hlc: hlc.tuple(),
                payload,
                node: self.id.clone(),
            },
        );
        self.inflight.insert(package_id.to_string(), message.clone());

        message
    }

    /// Applies a received message, returning whether it updated local state.
    ///
    /// The clock merges the remote stamp unconditionally. The update applies
    /// only if no entry is stored yet or the stored stamp is strictly older
    /// in `(phys, cnt)` order; a stale arrival leaves state untouched and
    /// returns `false`. Either way the package stops being in flight here.
    pub fn receive(&mut self, message: &Message, arrival_ts: u64) -> bool {
        self.clock.merge(&message.hlc);

        let incoming = message.hlc.tuple();
        let applied = match self.state.get(&message.package_id) {
            None => true,
            Some(stored) => stored.hlc < incoming,
        };

        if applied {
            self.state.insert(
                message.package_id.clone(),
                PackageEntry {
                    hlc: incoming,
                    payload: message.payload.clone(),
                    node: message.src.clone(),
                },
            );
        }

        self.inflight.remove(&message.package_id);
        self.log_event(NodeAction::Recv, message, arrival_ts);

        applied
    }

    fn log_event(&self, action: NodeAction, message: &Message, arrival_ts: u64) {
        self.journal.append_best_effort(&NodeLogEntry {
            action,
            src: message.src.clone(),
            dst: message.dst.clone(),
            hlc: message.hlc.clone(),
            package_id: message.package_id.clone(),
            payload: message.payload.clone(),
            sent_ts: message.sent_ts,
            arrival_ts,
        });
    }
}
