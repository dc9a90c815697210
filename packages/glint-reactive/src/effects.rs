//! Side effects!

use slotmap::Key;

use crate::*;

/// A handle to an effect created with [`create_effect`], used to stop it.
#[derive(Clone, Copy)]
pub struct EffectHandle {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
}

impl EffectHandle {
    /// Detach the effect from everything it subscribes to and stop it for
    /// good. Stopping an already-stopped effect does nothing.
    pub fn stop(self) {
        self.root.stop_subscriber(self.id);
    }
}

/// Creates an effect on signals used inside the effect closure.
///
/// The closure runs once immediately, tracking every signal and memo it
/// reads, and re-runs whenever one of them commits a change. Re-runs are
/// scheduled in notification order and coalesced by [`batch`](crate::batch).
///
/// # Example
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
///
/// create_effect(move || {
///     println!("new state = {}", state.get());
/// });
/// // Prints "new state = 0"
///
/// state.set(1);
/// // Prints "new state = 1"
/// # });
/// ```
///
/// `create_effect` should only be used for creating **side-effects**. It is
/// generally not recommended to update signal states inside an effect. You
/// probably should be using a [`create_memo`](crate::create_memo) instead.
///
/// An effect created while another effect or an [effect
/// scope](crate::create_effect_scope) is tracking belongs to it: it is
/// stopped along with its owner, or when the owning effect re-runs.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect(f: impl FnMut() + 'static) -> EffectHandle {
    let root = Root::global();
    let id = root.insert_node(
        NodeKind::Effect {
            run: Some(Box::new(f)),
        },
        NodeFlags::WATCHING,
    );
    let owner = root.current_sub.get();
    if !owner.is_null() {
        root.link(id, owner);
    }
    root.run_effect(id);
    EffectHandle { id, root }
}
