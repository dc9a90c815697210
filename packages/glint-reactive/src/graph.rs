//! Linking, propagation, and dirty checking over the reactive graph.
//!
//! Everything here is driven either top-down by a signal write (propagate,
//! then flush) or bottom-up by a read (refresh, which dirty-checks and
//! recomputes just enough of the graph to answer). Both traversals are
//! iterative with explicit stacks so graph depth never turns into call-stack
//! depth.

use slotmap::Key;

use crate::*;

impl Root {
    /// Record the node as a dependency of the subscriber currently tracking,
    /// if any.
    pub(crate) fn track_node(&self, id: NodeId) {
        let sub = self.current_sub.get();
        if sub.is_null() {
            return;
        }
        let tracks = self
            .nodes
            .borrow()
            .get(sub)
            .is_some_and(|node| node.flags.intersects(NodeFlags::MUTABLE | NodeFlags::WATCHING));
        if tracks {
            self.link(id, sub);
        }
    }

    /// Establish (or refresh) the edge `dep -> sub` for the subscriber's
    /// current tracking pass.
    pub(crate) fn link(&self, dep: NodeId, sub: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();
        let Some(sub_node) = nodes.get(sub) else { return };
        debug_assert!(
            sub_node.flags.contains(NodeFlags::RECURSED_CHECK),
            "link outside of a tracked run"
        );
        let version = sub_node.version;
        let deps_tail = sub_node.deps_tail;
        // The dep was linked by the read immediately before this one.
        if !deps_tail.is_null() && links[deps_tail].dep == dep {
            return;
        }
        // A stable dependency set lines up with the previous pass: reuse the
        // next link in place.
        let next_dep = if deps_tail.is_null() {
            sub_node.deps
        } else {
            links[deps_tail].next_dep
        };
        if !next_dep.is_null() && links[next_dep].dep == dep {
            links[next_dep].version = version;
            nodes[sub].deps_tail = next_dep;
            return;
        }
        // A re-read of a dep already linked earlier in this pass.
        let subs_tail = nodes[dep].subs_tail;
        if !subs_tail.is_null() {
            let tail = &links[subs_tail];
            if tail.sub == sub && tail.version == version {
                return;
            }
        }
        let id = links.insert(Link {
            dep,
            sub,
            version,
            prev_dep: deps_tail,
            next_dep,
            prev_sub: subs_tail,
            next_sub: LinkId::null(),
        });
        if !next_dep.is_null() {
            links[next_dep].prev_dep = id;
        }
        if !deps_tail.is_null() {
            links[deps_tail].next_dep = id;
        } else {
            nodes[sub].deps = id;
        }
        if !subs_tail.is_null() {
            links[subs_tail].next_sub = id;
        } else {
            nodes[dep].subs = id;
        }
        nodes[sub].deps_tail = id;
        nodes[dep].subs_tail = id;
    }

    /// Remove a link from both of its lists. Returns the next link in the
    /// subscriber's dependency list so callers can sweep forward.
    pub(crate) fn unlink(&self, id: LinkId) -> LinkId {
        let (dep, newly_unwatched, next_dep) = {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            let Link {
                dep,
                sub,
                prev_dep,
                next_dep,
                prev_sub,
                next_sub,
                ..
            } = links.remove(id).expect("link already unlinked");
            if !next_dep.is_null() {
                links[next_dep].prev_dep = prev_dep;
            } else if let Some(node) = nodes.get_mut(sub) {
                node.deps_tail = prev_dep;
            }
            if !prev_dep.is_null() {
                links[prev_dep].next_dep = next_dep;
            } else if let Some(node) = nodes.get_mut(sub) {
                node.deps = next_dep;
            }
            if !next_sub.is_null() {
                links[next_sub].prev_sub = prev_sub;
            } else if let Some(node) = nodes.get_mut(dep) {
                node.subs_tail = prev_sub;
            }
            let mut newly_unwatched = false;
            if !prev_sub.is_null() {
                links[prev_sub].next_sub = next_sub;
            } else if let Some(node) = nodes.get_mut(dep) {
                node.subs = next_sub;
                newly_unwatched = next_sub.is_null();
            }
            (dep, newly_unwatched, next_dep)
        };
        if newly_unwatched {
            self.on_unwatched(dep);
        }
        next_dep
    }

    /// A dependency just lost its last subscriber.
    fn on_unwatched(&self, dep: NodeId) {
        enum Unwatched {
            Keep,
            Evict,
            Stop,
        }
        let action = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(dep) {
                Some(node) => match node.kind {
                    NodeKind::Memo { .. } => {
                        // Lazy again: drop upstream links and recompute on
                        // the next read.
                        node.flags = NodeFlags::MUTABLE | NodeFlags::DIRTY;
                        Unwatched::Evict
                    }
                    NodeKind::Effect { .. } | NodeKind::Scope => Unwatched::Stop,
                    NodeKind::Signal { .. } => Unwatched::Keep,
                },
                None => Unwatched::Keep,
            }
        };
        match action {
            Unwatched::Evict => self.clear_deps(dep),
            Unwatched::Stop => self.stop_subscriber(dep),
            Unwatched::Keep => {}
        }
    }

    /// Unlink every dependency of `sub`.
    pub(crate) fn clear_deps(&self, sub: NodeId) {
        let mut link = self
            .nodes
            .borrow()
            .get(sub)
            .map_or(LinkId::null(), |node| node.deps);
        while !link.is_null() {
            link = self.unlink(link);
        }
    }

    /// Detach a subscriber (effect or scope) from the graph and drop it.
    ///
    /// Idempotent: a second call finds the node gone and returns. Stopping an
    /// owner cascades, because every owned effect loses its last subscriber
    /// here and stops itself through [`Self::on_unwatched`].
    pub(crate) fn stop_subscriber(&self, id: NodeId) {
        if self.nodes.borrow().get(id).is_none() {
            return;
        }
        self.clear_deps(id);
        loop {
            let link = self
                .nodes
                .borrow()
                .get(id)
                .map_or(LinkId::null(), |node| node.subs);
            if link.is_null() {
                break;
            }
            self.unlink(link);
        }
        self.nodes.borrow_mut().remove(id);
    }

    /// Open a fresh tracking pass for `sub`.
    pub(crate) fn start_tracking(&self, sub: NodeId) {
        let version = self.cycle.get() + 1;
        self.cycle.set(version);
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(sub) else { return };
        node.version = version;
        node.deps_tail = LinkId::null();
        node.flags = (node.flags - (NodeFlags::RECURSED | NodeFlags::DIRTY | NodeFlags::PENDING))
            | NodeFlags::RECURSED_CHECK;
    }

    /// Close a tracking pass: purge the dependencies the pass did not touch
    /// and leave the tracked region.
    pub(crate) fn end_tracking(&self, sub: NodeId) {
        let stale = {
            let nodes = self.nodes.borrow();
            let links = self.links.borrow();
            match nodes.get(sub) {
                Some(node) if node.deps_tail.is_null() => node.deps,
                Some(node) => links[node.deps_tail].next_dep,
                None => LinkId::null(),
            }
        };
        let mut link = stale;
        while !link.is_null() {
            link = self.unlink(link);
        }
        if let Some(node) = self.nodes.borrow_mut().get_mut(sub) {
            node.flags.remove(NodeFlags::RECURSED_CHECK);
        }
    }

    /// Entry point after a signal write: mark the signal stale, push the
    /// notification downstream, and flush when not batching.
    pub(crate) fn notify_write(&'static self, id: NodeId) {
        let subs = {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            node.flags = NodeFlags::MUTABLE | NodeFlags::DIRTY;
            node.subs
        };
        if !subs.is_null() {
            self.propagate(subs);
            if self.batch_depth.get() == 0 {
                self.flush();
            }
        }
    }

    /// Push a change notification down the subscriber lists, marking every
    /// reachable subscriber pending and queueing watchers.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub(crate) fn propagate(&self, head: LinkId) {
        // Reuse the shared stack buffer if possible.
        let mut local = Vec::new();
        let mut shared = self.propagate_buf.try_borrow_mut();
        let stack: &mut Vec<LinkId> = match shared.as_mut() {
            Ok(buf) => {
                buf.clear();
                buf
            }
            Err(_) => &mut local,
        };

        let mut current = head;
        let mut next = self.links.borrow()[current].next_sub;
        'outer: loop {
            let (sub, version) = {
                let links = self.links.borrow();
                let link = &links[current];
                (link.sub, link.version)
            };
            let mut notify = false;
            let mut descend = false;
            {
                let mut nodes = self.nodes.borrow_mut();
                let node = &mut nodes[sub];
                let flags = node.flags;
                if !flags.intersects(
                    NodeFlags::RECURSED_CHECK
                        | NodeFlags::RECURSED
                        | NodeFlags::DIRTY
                        | NodeFlags::PENDING,
                ) {
                    node.flags = flags | NodeFlags::PENDING;
                    notify = flags.contains(NodeFlags::WATCHING);
                    descend = flags.contains(NodeFlags::MUTABLE);
                } else if !flags.intersects(NodeFlags::RECURSED_CHECK | NodeFlags::RECURSED) {
                    // Already pending or dirty: the wave stops here until a
                    // dirty check resolves the node.
                } else if !flags.contains(NodeFlags::RECURSED_CHECK) {
                    // Leftover recursion mark from an earlier pass.
                    node.flags = (flags - NodeFlags::RECURSED) | NodeFlags::PENDING;
                    notify = flags.contains(NodeFlags::WATCHING);
                    descend = flags.contains(NodeFlags::MUTABLE);
                } else if !flags.intersects(NodeFlags::DIRTY | NodeFlags::PENDING)
                    && version == node.version
                {
                    // Hit mid-run through a dependency of the current pass.
                    node.flags = flags | NodeFlags::RECURSED | NodeFlags::PENDING;
                    descend = flags.contains(NodeFlags::MUTABLE);
                }
            }
            if notify {
                self.enqueue_effect(sub);
            }
            if descend {
                let sub_subs = self.nodes.borrow()[sub].subs;
                if !sub_subs.is_null() {
                    let first_next = self.links.borrow()[sub_subs].next_sub;
                    if !first_next.is_null() {
                        stack.push(next);
                        next = first_next;
                    }
                    current = sub_subs;
                    continue;
                }
            }
            if !next.is_null() {
                current = next;
                next = self.links.borrow()[current].next_sub;
                continue;
            }
            while let Some(saved) = stack.pop() {
                if !saved.is_null() {
                    current = saved;
                    next = self.links.borrow()[current].next_sub;
                    continue 'outer;
                }
            }
            break;
        }
    }

    /// Promote the direct subscribers of a freshly-changed dependency from
    /// pending to dirty, queueing watchers.
    pub(crate) fn shallow_propagate(&self, head: LinkId) {
        let mut link = head;
        while !link.is_null() {
            let (sub, next) = {
                let links = self.links.borrow();
                let link = &links[link];
                (link.sub, link.next_sub)
            };
            let notify = {
                let mut nodes = self.nodes.borrow_mut();
                let node = &mut nodes[sub];
                let flags = node.flags;
                if flags & (NodeFlags::PENDING | NodeFlags::DIRTY) == NodeFlags::PENDING {
                    node.flags = flags | NodeFlags::DIRTY;
                    flags.contains(NodeFlags::WATCHING)
                } else {
                    false
                }
            };
            if notify {
                self.enqueue_effect(sub);
            }
            link = next;
        }
    }

    /// Confirm whether a pending subscriber really has a changed transitive
    /// dependency before it may be treated as dirty.
    ///
    /// Walks the dependency lists with an explicit stack and depth counter.
    /// Signal dependencies commit their stored value; memo dependencies
    /// recompute bottom-up on the unwind, shallow-promoting their other
    /// subscribers whenever a recomputation really changed the value.
    pub(crate) fn check_dirty(&'static self, head: LinkId, sub: NodeId) -> bool {
        let mut stack: Vec<LinkId> = Vec::new();
        let mut depth = 0usize;
        let mut link = head;
        let mut sub = sub;
        'top: loop {
            let (dep, prev_sub, next_sub, next_dep) = {
                let links = self.links.borrow();
                let entry = &links[link];
                (entry.dep, entry.prev_sub, entry.next_sub, entry.next_dep)
            };
            let sub_flags = self.nodes.borrow()[sub].flags;
            let dep_flags = self.nodes.borrow()[dep].flags;
            let mut dirty = false;
            if sub_flags.contains(NodeFlags::DIRTY) {
                dirty = true;
            } else if dep_flags.contains(NodeFlags::MUTABLE | NodeFlags::DIRTY) {
                if self.update_node(dep) {
                    let subs = self.nodes.borrow()[dep].subs;
                    if !self.links.borrow()[subs].next_sub.is_null() {
                        self.shallow_propagate(subs);
                    }
                    dirty = true;
                }
            } else if dep_flags.contains(NodeFlags::MUTABLE | NodeFlags::PENDING) {
                let dep_deps = self.nodes.borrow()[dep].deps;
                if dep_deps.is_null() {
                    // Pending with nothing upstream cannot be stale.
                    self.nodes.borrow_mut()[dep].flags.remove(NodeFlags::PENDING);
                } else {
                    if !next_sub.is_null() || !prev_sub.is_null() {
                        stack.push(link);
                    }
                    link = dep_deps;
                    sub = dep;
                    depth += 1;
                    continue 'top;
                }
            }
            if !dirty && !next_dep.is_null() {
                link = next_dep;
                continue 'top;
            }
            loop {
                if depth == 0 {
                    return dirty;
                }
                depth -= 1;
                let first_sub = self.nodes.borrow()[sub].subs;
                let has_multiple_subs = !self.links.borrow()[first_sub].next_sub.is_null();
                link = if has_multiple_subs {
                    stack.pop().expect("dirty check stack underflow")
                } else {
                    first_sub
                };
                if dirty {
                    if self.update_node(sub) {
                        if has_multiple_subs {
                            self.shallow_propagate(first_sub);
                        }
                        sub = self.links.borrow()[link].sub;
                        continue;
                    }
                } else {
                    self.nodes.borrow_mut()[sub].flags.remove(NodeFlags::PENDING);
                }
                sub = self.links.borrow()[link].sub;
                let outer_next_dep = self.links.borrow()[link].next_dep;
                if !outer_next_dep.is_null() {
                    link = outer_next_dep;
                    continue 'top;
                }
                dirty = false;
            }
        }
    }

    /// Bring a stale value node up to date. Returns whether the committed
    /// value changed.
    pub(crate) fn update_node(&'static self, id: NodeId) -> bool {
        let is_signal = matches!(self.nodes.borrow()[id].kind, NodeKind::Signal { .. });
        if is_signal {
            self.update_signal(id)
        } else {
            self.update_memo(id)
        }
    }

    /// Commit a signal's stored value, comparing against the last committed
    /// value.
    pub(crate) fn update_signal(&self, id: NodeId) -> bool {
        let mut nodes = self.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.flags = NodeFlags::MUTABLE;
        match &mut node.kind {
            NodeKind::Signal {
                value,
                previous,
                changed,
            } => {
                let changed = *changed;
                let stored = value.as_ref().expect("value updating");
                let changed_now = changed(previous, stored.as_ref());
                *previous = None;
                changed_now
            }
            _ => unreachable!("update_signal on a non-signal node"),
        }
    }

    /// Recompute a memo under tracking. Returns whether the cached value
    /// changed.
    pub(crate) fn update_memo(&'static self, id: NodeId) -> bool {
        self.start_tracking(id);
        let taken = {
            let mut nodes = self.nodes.borrow_mut();
            nodes.get_mut(id).and_then(|node| match &mut node.kind {
                NodeKind::Memo { value, compute } => {
                    compute.take().map(|compute| (value.take(), compute))
                }
                _ => unreachable!("update_memo on a non-memo node"),
            })
        };
        // A missing callback means the node is already mid-update (or its
        // last run panicked); leave the tracking pass without re-entering
        // user code.
        let Some((mut value, mut compute)) = taken else {
            self.end_tracking(id);
            return false;
        };
        let changed = {
            let _guard = TrackingGuard::new(self, id);
            compute(&mut value)
        };
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            if let NodeKind::Memo {
                value: value_slot,
                compute: compute_slot,
            } = &mut node.kind
            {
                *value_slot = value;
                *compute_slot = Some(compute);
            }
        }
        changed
    }

    /// Pull path for reads: make sure the node's value is current before it
    /// is observed, promoting subscribers if a commit confirms a change.
    pub(crate) fn refresh_node(&'static self, id: NodeId) {
        let Some((flags, deps, is_signal)) = ({
            let nodes = self.nodes.borrow();
            nodes.get(id).map(|node| {
                (
                    node.flags,
                    node.deps,
                    matches!(node.kind, NodeKind::Signal { .. }),
                )
            })
        }) else {
            return;
        };
        if is_signal {
            if flags.contains(NodeFlags::DIRTY) && self.update_signal(id) {
                let subs = self.nodes.borrow()[id].subs;
                if !subs.is_null() {
                    self.shallow_propagate(subs);
                }
            }
        } else if flags.contains(NodeFlags::DIRTY)
            || (flags.contains(NodeFlags::PENDING) && !deps.is_null() && self.check_dirty(deps, id))
        {
            if self.update_memo(id) {
                let subs = self.nodes.borrow()[id].subs;
                if !subs.is_null() {
                    self.shallow_propagate(subs);
                }
            }
        } else if flags.contains(NodeFlags::PENDING) {
            self.nodes.borrow_mut()[id].flags.remove(NodeFlags::PENDING);
        }
    }
}

#[cfg(test)]
mod tests {
    use slotmap::Key;

    use crate::*;

    fn subs_len(id: NodeId) -> usize {
        let root = Root::global();
        let nodes = root.nodes.borrow();
        let links = root.links.borrow();
        let mut len = 0;
        let mut link = nodes[id].subs;
        while !link.is_null() {
            len += 1;
            link = links[link].next_sub;
        }
        len
    }

    fn deps_len(id: NodeId) -> usize {
        let root = Root::global();
        let nodes = root.nodes.borrow();
        let links = root.links.borrow();
        let mut len = 0;
        let mut link = nodes[id].deps;
        while !link.is_null() {
            len += 1;
            link = links[link].next_dep;
        }
        len
    }

    #[test]
    fn single_dependency_propagation() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let b = create_memo(move || a.get() * 2);
            let log = create_signal(Vec::new());
            create_effect(move || {
                let value = b.get();
                log.update_silent(|log| log.push(value));
            });
            assert_eq!(log.get_clone(), vec![2]);
            a.set(3);
            assert_eq!(log.get_clone(), vec![2, 6]);
            a.set(3);
            assert_eq!(log.get_clone(), vec![2, 6]);
        });
    }

    #[test]
    fn diamond_dependencies_are_glitch_free() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let b = create_memo(move || a.get() + 1);
            let c = create_memo(move || a.get() + 1);
            let d = create_memo(move || b.get() + c.get());
            let log = create_signal(Vec::new());
            create_effect(move || {
                let value = d.get();
                log.update_silent(|log| log.push(value));
            });
            assert_eq!(log.get_clone(), vec![4]);
            a.set(2);
            // No intermediate 5: d observed b and c together.
            assert_eq!(log.get_clone(), vec![4, 6]);
        });
    }

    #[test]
    fn duplicate_reads_link_once() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let sum = create_memo(move || a.get() + a.get() + a.get());
            assert_eq!(sum.get(), 3);
            assert_eq!(subs_len(a.0.id), 1);
            assert_eq!(deps_len(sum.0.id), 1);
            a.set(2);
            assert_eq!(sum.get(), 6);
            assert_eq!(subs_len(a.0.id), 1);
            assert_eq!(deps_len(sum.0.id), 1);
        });
    }

    #[test]
    fn dependencies_follow_read_order_each_pass() {
        let _ = create_root(|| {
            let cond = create_signal(true);
            let x = create_signal(10);
            let y = create_signal(20);
            let out = create_signal(0);
            create_effect(move || {
                out.set(if cond.get() { x.get() } else { y.get() });
            });
            assert_eq!(out.get(), 10);
            assert_eq!(subs_len(x.0.id), 1);
            assert_eq!(subs_len(y.0.id), 0);

            y.set(99);
            assert_eq!(out.get(), 10);

            cond.set(false);
            assert_eq!(out.get(), 99);
            assert_eq!(subs_len(x.0.id), 0);
            assert_eq!(subs_len(y.0.id), 1);

            x.set(77);
            assert_eq!(out.get(), 99);
        });
    }

    #[test]
    fn stopping_the_last_subscriber_evicts_memo_deps() {
        let _ = create_root(|| {
            let a = create_signal(0);
            let c = create_memo(move || a.get() * 2);
            let handle = create_effect(move || {
                c.track();
            });
            assert_eq!(subs_len(a.0.id), 1);
            assert_eq!(subs_len(c.0.id), 1);

            handle.stop();
            assert_eq!(subs_len(a.0.id), 0);
            assert_eq!(subs_len(c.0.id), 0);
            assert_eq!(deps_len(c.0.id), 0);

            // Still readable: recomputes lazily.
            assert_eq!(c.get(), 0);
        });
    }

    #[test]
    fn deep_memo_chains_do_not_blow_the_stack() {
        let _ = create_root(|| {
            let a = create_signal(0);
            let mut last = create_memo(move || a.get());
            for _ in 0..300 {
                let prev = last;
                last = create_memo(move || prev.get() + 1);
            }
            let out = create_signal(-1);
            create_effect(move || {
                out.set(last.get());
            });
            assert_eq!(out.get(), 300);
            a.set(5);
            assert_eq!(out.get(), 305);
        });
    }

    #[test]
    fn memo_recomputes_at_most_once_per_wave() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let runs = create_signal(0);
            let b = create_memo(move || {
                runs.set_silent(runs.get_untracked() + 1);
                a.get() + 1
            });
            let c = create_memo(move || b.get() * 10);
            let d = create_memo(move || b.get() * 100);
            let out = create_signal(0);
            create_effect(move || {
                out.set(c.get() + d.get());
            });
            assert_eq!(out.get(), 220);
            assert_eq!(runs.get(), 1);
            a.set(2);
            assert_eq!(out.get(), 330);
            assert_eq!(runs.get(), 2);
        });
    }
}
