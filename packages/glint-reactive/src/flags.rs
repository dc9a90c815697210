//! Per-node state bits.

use bitflags::bitflags;

bitflags! {
    /// Compact state carried by every [`ReactiveNode`](crate::node::ReactiveNode).
    ///
    /// The two role bits (`MUTABLE`, `WATCHING`) are fixed for the lifetime of
    /// a node; the remaining four track where the node currently sits in the
    /// propagation / dirty-check protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct NodeFlags: u8 {
        /// The node holds a value: signals and memos.
        const MUTABLE = 1 << 0;
        /// The node is an active subscriber: effects and live scopes.
        /// Doubles as the "not queued" marker for the effect queue.
        const WATCHING = 1 << 1;
        /// A tracked run of this node is in progress.
        const RECURSED_CHECK = 1 << 2;
        /// The node was reached by propagation while it was being tracked.
        const RECURSED = 1 << 3;
        /// The value is known stale and must be recomputed or committed.
        const DIRTY = 1 << 4;
        /// Some upstream changed; staleness must be confirmed by a dirty
        /// check before the node may be treated as `DIRTY`.
        const PENDING = 1 << 5;
    }
}
