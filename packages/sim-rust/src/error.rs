//! Error taxonomy for orchestrator operations.
//!
//! Validation errors fail the call synchronously with no side effects.
//! Journal and snapshot I/O is best-effort and never surfaces here; only
//! setup-time I/O (creating log directories and per-node journals) does.

/// Errors returned by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A send or snapshot referenced a node id that was never registered.
    #[error("unknown node: {id}")]
    UnknownNode {
        /// The offending node id.
        id: String,
    },

    /// A region-scoped operation referenced an unregistered region.
    #[error("unknown region: {id}")]
    UnknownRegion {
        /// The offending region id.
        id: String,
    },

    /// `add_node` was called with an id that already exists.
    #[error("node already registered: {id}")]
    DuplicateNode {
        /// The duplicate node id.
        id: String,
    },

    /// Setup-time I/O failed (log directory or per-node journal creation).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
