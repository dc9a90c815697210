//! Reactive graph storage: nodes and the links connecting them.

use std::any::Any;

use slotmap::{new_key_type, Key};

use crate::flags::NodeFlags;

new_key_type! {
    pub(crate) struct NodeId;
}

new_key_type! {
    pub(crate) struct LinkId;
}

/// A directed edge from a dependency to one of its subscribers.
///
/// Every link is threaded through two doubly-linked lists at once: the
/// subscriber's dependency list (`prev_dep`/`next_dep`) and the dependency's
/// subscriber list (`prev_sub`/`next_sub`). Null keys terminate the chains.
/// A link appears in each list exactly once.
pub(crate) struct Link {
    pub dep: NodeId,
    pub sub: NodeId,
    /// Tracking pass that last established or reused this link. A link whose
    /// version matches its subscriber's current pass has already been seen
    /// this pass.
    pub version: u64,
    pub prev_dep: LinkId,
    pub next_dep: LinkId,
    pub prev_sub: LinkId,
    pub next_sub: LinkId,
}

/// A node in the reactive graph: the header shared by all four roles plus the
/// role-specific payload.
pub(crate) struct ReactiveNode {
    pub flags: NodeFlags,
    /// Version of the node's latest tracking pass.
    pub version: u64,
    /// Head and tail of the dependency list (links where this node is `sub`).
    pub deps: LinkId,
    pub deps_tail: LinkId,
    /// Head and tail of the subscriber list (links where this node is `dep`).
    pub subs: LinkId,
    pub subs_tail: LinkId,
    pub kind: NodeKind,
}

/// Role-specific payload of a [`ReactiveNode`].
///
/// Values are type-erased; the typed halves live either in the generic handle
/// methods or in the stored callbacks, which capture the concrete type at
/// creation.
pub(crate) enum NodeKind {
    Signal {
        /// The stored value. Writes land here immediately; reads always
        /// observe this slot. `None` only while an update closure runs.
        value: Option<Box<dyn Any>>,
        /// The last value committed to subscribers. `Some` only while a write
        /// is awaiting its commit, so the commit can detect a round trip back
        /// to the old value.
        previous: Option<Box<dyn Any>>,
        /// Compares `previous` against `value` at commit time.
        changed: fn(&Option<Box<dyn Any>>, &dyn Any) -> bool,
    },
    Memo {
        /// Cached output. `None` before the first evaluation and while a
        /// recomputation runs.
        value: Option<Box<dyn Any>>,
        /// Recomputes the cached output in place and reports whether it
        /// changed. `None` while the memo is mid-recomputation.
        compute: Option<Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> bool>>,
    },
    Effect {
        /// The user thunk. `None` while the effect is mid-run.
        run: Option<Box<dyn FnMut()>>,
    },
    Scope,
}

/// Commit comparison for a signal of type `T`, stored as a plain function
/// pointer in the node.
pub(crate) fn signal_changed<T: PartialEq + 'static>(
    previous: &Option<Box<dyn Any>>,
    value: &dyn Any,
) -> bool {
    match previous {
        Some(previous) => previous.downcast_ref::<T>() != value.downcast_ref::<T>(),
        None => false,
    }
}

impl ReactiveNode {
    pub fn new(kind: NodeKind, flags: NodeFlags) -> Self {
        Self {
            flags,
            version: 0,
            deps: LinkId::null(),
            deps_tail: LinkId::null(),
            subs: LinkId::null(),
            subs_tail: LinkId::null(),
            kind,
        }
    }
}
