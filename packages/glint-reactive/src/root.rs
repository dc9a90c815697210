//! [`Root`] of the reactive system: global state, batching, and the effect
//! queue.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

use crate::*;

/// The struct managing the state of the reactive system. Only one should be
/// created per running app.
///
/// Often times, this is intended to be leaked to be able to get a
/// `&'static Root`. However, the `Root` is also `dispose`-able, meaning that
/// any resources allocated in this `Root` will get deallocated. Therefore in
/// practice, there should be no memory leak at all except for the `Root`
/// itself.
pub(crate) struct Root {
    /// All the nodes created in this `Root`.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// Pool of edges threading the dependency and subscriber lists.
    pub links: RefCell<SlotMap<LinkId, Link>>,
    /// The subscriber whose tracked run is currently in progress. Reads
    /// performed now become its dependencies. Null when nothing is tracking.
    pub current_sub: Cell<NodeId>,
    /// Version source for tracking passes.
    pub cycle: Cell<u64>,
    /// Number of nested [`batch`] regions currently open. Effects only flush
    /// at depth zero.
    pub batch_depth: Cell<u32>,
    /// Effects reached by propagation, in notification order.
    pub effect_queue: RefCell<VecDeque<NodeId>>,
    /// A temporary buffer used by the propagation pass to prevent allocating
    /// a new stack every time it is called.
    pub propagate_buf: RefCell<Vec<LinkId>>,
}

thread_local! {
    /// The current reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Get the current reactive root. Panics if no root is found.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|root| root.get()).expect("no root found")
    }

    /// Sets the current reactive root. Returns the previous root.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        GLOBAL_ROOT.with(|r| r.replace(root))
    }

    /// Create a new reactive root. This root is leaked and so lives until the
    /// end of the program.
    pub fn new_static() -> &'static Self {
        let this = Self {
            nodes: RefCell::new(SlotMap::default()),
            links: RefCell::new(SlotMap::default()),
            current_sub: Cell::new(NodeId::null()),
            cycle: Cell::new(0),
            batch_depth: Cell::new(0),
            effect_queue: RefCell::new(VecDeque::new()),
            propagate_buf: RefCell::new(Vec::new()),
        };
        Box::leak(Box::new(this))
    }

    /// Disposes of all the resources held on by this root and resets the
    /// state.
    pub fn reinit(&'static self) {
        let _ = self.nodes.take();
        let _ = self.links.take();
        let _ = self.effect_queue.take();
        let _ = self.propagate_buf.take();
        self.current_sub.set(NodeId::null());
        self.cycle.set(0);
        self.batch_depth.set(0);
    }

    /// Insert a fresh, unlinked node into the arena.
    pub fn insert_node(&self, kind: NodeKind, flags: NodeFlags) -> NodeId {
        self.nodes.borrow_mut().insert(ReactiveNode::new(kind, flags))
    }

    /// Opens a batch region.
    pub fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    /// Closes a batch region and flushes queued effects once the outermost
    /// region ends.
    pub fn end_batch(&'static self) {
        let depth = self.batch_depth.get() - 1;
        self.batch_depth.set(depth);
        if depth == 0 {
            self.flush();
        }
    }

    /// Queue a watching subscriber reached by propagation.
    ///
    /// The `WATCHING` bit is cleared while the node sits in the queue, which
    /// makes a second enqueue a no-op. Owners found by walking the subscriber
    /// chain upward are queued ahead of the nodes they own, so outer effects
    /// always run before inner ones.
    pub fn enqueue_effect(&self, id: NodeId) {
        let mut chain: SmallVec<[NodeId; 4]> = SmallVec::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            let links = self.links.borrow();
            let mut current = id;
            loop {
                let Some(node) = nodes.get_mut(current) else { break };
                if !node.flags.contains(NodeFlags::WATCHING) {
                    break;
                }
                node.flags.remove(NodeFlags::WATCHING);
                chain.push(current);
                if node.subs.is_null() {
                    break;
                }
                current = links[node.subs].sub;
            }
        }
        let mut queue = self.effect_queue.borrow_mut();
        for &effect in chain.iter().rev() {
            queue.push_back(effect);
        }
    }

    /// Drain the effect queue in notification order.
    ///
    /// Re-entrant flushes (an effect writing a signal outside any batch) are
    /// harmless: the nested flush simply drains ahead of this one.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub fn flush(&'static self) {
        #[cfg(feature = "trace")]
        tracing::trace!("flush len: {}", self.effect_queue.borrow().len());
        loop {
            let next = self.effect_queue.borrow_mut().pop_front();
            let Some(id) = next else { break };
            self.run_queued(id);
        }
    }

    /// Handle one dequeued subscriber: restore its `WATCHING` bit, confirm
    /// staleness, and re-run it if warranted.
    fn run_queued(&'static self, id: NodeId) {
        let entry = {
            let mut nodes = self.nodes.borrow_mut();
            // The node may have been stopped while it sat in the queue.
            nodes.get_mut(id).map(|node| {
                node.flags.insert(NodeFlags::WATCHING);
                (node.flags, node.deps)
            })
        };
        let Some((flags, deps)) = entry else { return };
        if flags.contains(NodeFlags::DIRTY)
            || (flags.contains(NodeFlags::PENDING)
                && !deps.is_null()
                && self.check_dirty(deps, id))
        {
            let is_effect = {
                let nodes = self.nodes.borrow();
                match nodes.get(id) {
                    Some(node) => matches!(node.kind, NodeKind::Effect { .. }),
                    None => return,
                }
            };
            if is_effect {
                self.run_effect(id);
            } else {
                // Scopes queue like effects but have nothing to re-run.
                self.nodes.borrow_mut()[id]
                    .flags
                    .remove(NodeFlags::DIRTY | NodeFlags::PENDING);
            }
        } else if flags.contains(NodeFlags::PENDING) {
            self.nodes.borrow_mut()[id].flags.remove(NodeFlags::PENDING);
        }
    }

    /// Run an effect's thunk under tracking. Used both for the initial run on
    /// creation and for every re-run out of the queue.
    pub fn run_effect(&'static self, id: NodeId) {
        self.start_tracking(id);
        let run = {
            let mut nodes = self.nodes.borrow_mut();
            nodes.get_mut(id).and_then(|node| match &mut node.kind {
                NodeKind::Effect { run } => run.take(),
                _ => None,
            })
        };
        // A missing thunk means the node is already mid-run or its last run
        // panicked; close the pass, dropping the old dependency set.
        let Some(mut run) = run else {
            self.end_tracking(id);
            return;
        };
        {
            let _guard = TrackingGuard::new(self, id);
            run();
        }
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            if let NodeKind::Effect { run: slot } = &mut node.kind {
                *slot = Some(run);
            }
        }
    }
}

/// Scoped swap of the active subscriber for a tracked run.
///
/// Dropping the guard restores the previous subscriber and finishes the
/// tracking pass (stale dependencies purged, `RECURSED_CHECK` cleared), so a
/// panicking user closure commits exactly the dependencies it read before
/// unwinding.
pub(crate) struct TrackingGuard {
    root: &'static Root,
    id: NodeId,
    prev: NodeId,
}

impl TrackingGuard {
    pub fn new(root: &'static Root, id: NodeId) -> Self {
        Self {
            root,
            id,
            prev: root.current_sub.replace(id),
        }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.root.current_sub.set(self.prev);
        self.root.end_tracking(self.id);
    }
}

/// A handle to a root. This lets you reinitialize or dispose the root for
/// resource cleanup.
///
/// This is generally obtained from [`create_root`].
#[derive(Clone, Copy)]
pub struct RootHandle {
    _ref: &'static Root,
}

impl RootHandle {
    /// Destroy everything that was created in this root.
    pub fn dispose(&self) {
        self._ref.reinit();
    }

    /// Runs the closure with this root installed as the current root.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Root::set_global(Some(self._ref));
        let ret = f();
        Root::set_global(prev);
        ret
    }
}

/// Creates a new reactive root. The returned [`RootHandle`] can be used to
/// [`dispose`](RootHandle::dispose) the root.
///
/// All other primitives must be created inside a root (or a
/// [`run_in`](RootHandle::run_in) region).
///
/// # Example
/// ```rust
/// # use glint_reactive::*;
/// create_root(|| {
///     let signal = create_signal(123);
///     assert_eq!(signal.get(), 123);
/// });
/// ```
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let _ref = Root::new_static();
    #[cfg(not(target_arch = "wasm32"))]
    {
        /// An unsafe wrapper around a raw pointer which we promise to never
        /// touch, effectively making it thread-safe.
        #[allow(dead_code)]
        struct UnsafeSendPtr<T>(*const T);
        /// We never ever touch the pointer inside so surely this is safe!
        unsafe impl<T> Send for UnsafeSendPtr<T> {}

        /// A static variable to keep on holding to the allocated `Root`s to
        /// prevent Miri and Valgrind from complaining.
        static KEEP_ALIVE: std::sync::Mutex<Vec<UnsafeSendPtr<Root>>> =
            std::sync::Mutex::new(Vec::new());
        KEEP_ALIVE
            .lock()
            .unwrap()
            .push(UnsafeSendPtr(_ref as *const Root));
    }

    Root::set_global(Some(_ref));
    f();
    Root::set_global(None);
    RootHandle { _ref }
}

/// Batch updates from related signals together and only run effects at the
/// end of the scope.
///
/// Reads stay fresh inside the batch: a memo read after a batched write
/// observes the new value. Only effect runs are deferred, and an effect
/// reached through several batched writes still runs only once.
///
/// # Example
///
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_memo(move || state.get() * 2);
/// batch(move || {
///     state.set(2);
///     assert_eq!(double.get(), 4);
/// });
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.start_batch();
    let guard = BatchGuard { root: Some(root) };
    let ret = f();
    guard.end();
    ret
}

struct BatchGuard {
    root: Option<&'static Root>,
}

impl BatchGuard {
    fn end(mut self) {
        self.root.take().unwrap().end_batch();
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        // Unwind path: the batch closes, but queued effects wait for the
        // next flush.
        if let Some(root) = self.root.take() {
            root.batch_depth.set(root.batch_depth.get() - 1);
        }
    }
}

/// Run the passed closure inside an untracked dependency scope.
///
/// See also [`ReadSignal::get_untracked`].
///
/// # Example
///
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_memo(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // double value should still be the old value because state was untracked
/// assert_eq!(double.get(), 2);
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    untrack_in_scope(f, Root::global())
}

/// Same as [`untrack`] but for a specific [`Root`].
pub(crate) fn untrack_in_scope<T>(f: impl FnOnce() -> T, root: &'static Root) -> T {
    struct Restore {
        root: &'static Root,
        prev: NodeId,
    }
    impl Drop for Restore {
        fn drop(&mut self) {
            self.root.current_sub.set(self.prev);
        }
    }
    let _guard = Restore {
        root,
        prev: root.current_sub.replace(NodeId::null()),
    };
    f()
}

/// Force-notify the current subscribers of every signal and memo read inside
/// `f`, as if each had changed value.
///
/// This is the escape hatch for values mutated behind the engine's back (or
/// interior mutability that equality cannot see): subscribers re-run even
/// though no stored value changed. All resulting effect runs are coalesced
/// into a single flush.
///
/// # Example
///
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let counter = create_signal(0);
/// create_effect(move || {
///     state.track();
///     counter.set(counter.get_untracked() + 1);
/// });
/// assert_eq!(counter.get(), 1);
///
/// trigger(move || {
///     state.track();
/// });
/// assert_eq!(counter.get(), 2);
/// # });
/// ```
pub fn trigger(f: impl FnOnce()) {
    let root = Root::global();
    let id = root.insert_node(NodeKind::Scope, NodeFlags::WATCHING);
    root.start_tracking(id);
    {
        let _guard = TrackingGuard::new(root, id);
        f();
    }
    root.start_batch();
    let mut link = root.nodes.borrow()[id].deps;
    while !link.is_null() {
        let dep = root.links.borrow()[link].dep;
        link = root.unlink(link);
        let subs = root
            .nodes
            .borrow()
            .get(dep)
            .map_or(LinkId::null(), |node| node.subs);
        if !subs.is_null() {
            root.propagate(subs);
            root.shallow_propagate(subs);
        }
    }
    root.nodes.borrow_mut().remove(id);
    root.end_batch();
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn batch_updates_effects_at_end() {
        let _ = create_root(|| {
            let state1 = create_signal(1);
            let state2 = create_signal(2);
            let counter = create_signal(0);
            create_effect(move || {
                counter.set(counter.get_untracked() + 1);
                let _ = state1.get() + state2.get();
            });
            assert_eq!(counter.get(), 1);
            state1.set(2);
            state2.set(3);
            assert_eq!(counter.get(), 3);
            batch(move || {
                state1.set(3);
                assert_eq!(counter.get(), 3);
                state2.set(4);
                assert_eq!(counter.get(), 3);
            });
            assert_eq!(counter.get(), 4);
        });
    }

    #[test]
    fn batch_reads_stay_fresh() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_memo(move || state.get() * 2);
            batch(move || {
                state.set(2);
                assert_eq!(state.get(), 2);
                assert_eq!(double.get(), 4);
            });
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn nested_batches_flush_once() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let counter = create_signal(0);
            create_effect(move || {
                state.track();
                counter.set(counter.get_untracked() + 1);
            });
            batch(move || {
                state.set(1);
                batch(move || {
                    state.set(2);
                });
                // Still inside the outer batch.
                assert_eq!(counter.get_untracked(), 1);
            });
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn batch_returns_value() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let out = batch(move || {
                state.set(2);
                state.get()
            });
            assert_eq!(out, 2);
        });
    }

    #[test]
    fn write_back_inside_batch_does_not_rerun() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let counter = create_signal(0);
            create_effect(move || {
                state.track();
                counter.set(counter.get_untracked() + 1);
            });
            assert_eq!(counter.get(), 1);
            batch(move || {
                state.set(2);
                state.set(1);
            });
            // The dirty check sees no committed change, so the effect stays
            // put.
            assert_eq!(counter.get(), 1);
            assert_eq!(state.get(), 1);
        });
    }

    #[test]
    fn untrack_in_effect() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let b = create_signal(1);
            let out = create_signal(0);
            create_effect(move || {
                out.set(a.get() + untrack(|| b.get()));
            });
            assert_eq!(out.get(), 2);

            b.set(100);
            assert_eq!(out.get(), 2);

            a.set(2);
            assert_eq!(out.get(), 102);
        });
    }

    #[test]
    fn effects_run_in_notification_order() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let log = create_signal(Vec::new());
            create_effect(move || {
                state.track();
                log.update(|log| log.push(1));
            });
            create_effect(move || {
                state.track();
                log.update(|log| log.push(2));
            });
            log.set(Vec::new());
            state.set(1);
            assert_eq!(log.get_clone(), vec![1, 2]);
        });
    }

    #[test]
    fn trigger_notifies_unchanged_dependencies() {
        let _ = create_root(|| {
            let state = create_signal(5);
            let counter = create_signal(0);
            create_effect(move || {
                state.track();
                counter.set(counter.get_untracked() + 1);
            });
            assert_eq!(counter.get(), 1);

            trigger(move || {
                state.track();
            });
            assert_eq!(counter.get(), 2);
            // The value itself never moved.
            assert_eq!(state.get(), 5);
        });
    }

    #[test]
    fn trigger_flushes_once_for_many_deps() {
        let _ = create_root(|| {
            let a = create_signal(0);
            let b = create_signal(0);
            let counter = create_signal(0);
            create_effect(move || {
                a.track();
                b.track();
                counter.set(counter.get_untracked() + 1);
            });
            assert_eq!(counter.get(), 1);

            trigger(move || {
                a.track();
                b.track();
            });
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn trigger_does_not_track_into_enclosing_scope() {
        let _ = create_root(|| {
            let a = create_signal(0);
            let b = create_signal(0);
            let counter = create_signal(0);
            create_effect(move || {
                a.track();
                counter.set(counter.get_untracked() + 1);
                trigger(move || {
                    // Read inside trigger must not become a dependency of the
                    // enclosing effect.
                    b.track();
                });
            });
            assert_eq!(counter.get(), 1);
            b.set(1);
            assert_eq!(counter.get(), 1);
        });
    }

    #[test]
    fn run_in_installs_the_root() {
        let mut state = None;
        let handle = create_root(|| {
            state = Some(create_signal(0));
        });
        let state = state.unwrap();
        handle.run_in(move || {
            state.set(1);
            assert_eq!(state.get(), 1);
        });
    }
}
