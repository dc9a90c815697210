//! Effect scopes: bulk ownership of effects.

use slotmap::Key;

use crate::*;

/// A handle to an effect scope created with [`create_effect_scope`].
#[derive(Clone, Copy)]
pub struct ScopeHandle {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
}

impl ScopeHandle {
    /// Stop the scope and everything it owns: every effect and nested scope
    /// created inside the scope closure is stopped with it. Idempotent.
    pub fn stop(self) {
        self.root.stop_subscriber(self.id);
    }
}

/// Creates a scope that collects the effects created inside it.
///
/// While the closure runs, the scope is the active subscriber, so any effect
/// (or nested scope) created inside belongs to the scope. Stopping the scope
/// stops all of them in one call; the scope itself does nothing else.
///
/// # Example
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
/// let counter = create_signal(0);
///
/// let scope = create_effect_scope(move || {
///     create_effect(move || {
///         state.track();
///         counter.set(counter.get_untracked() + 1);
///     });
/// });
/// assert_eq!(counter.get(), 1);
///
/// state.set(1);
/// assert_eq!(counter.get(), 2);
///
/// scope.stop();
/// state.set(2);
/// // The effect was stopped along with its scope.
/// assert_eq!(counter.get(), 2);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect_scope(f: impl FnOnce()) -> ScopeHandle {
    let root = Root::global();
    let id = root.insert_node(NodeKind::Scope, NodeFlags::WATCHING);
    let owner = root.current_sub.get();
    if !owner.is_null() {
        root.link(id, owner);
    }
    root.start_tracking(id);
    {
        let _guard = TrackingGuard::new(root, id);
        f();
    }
    ScopeHandle { id, root }
}
