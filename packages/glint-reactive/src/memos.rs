//! Memos (lazy, cached derivations).

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::ops::Deref;

use crate::*;

/// A memoized computation derived from other signals and memos.
///
/// A `Memo` is read-only; it derefs to [`ReadSignal`], so all the usual read
/// methods apply. See [`create_memo`] for more information.
pub struct Memo<T: 'static>(pub(crate) ReadSignal<T>);

/// Creates a memoized computation from some signals.
///
/// The output is derived from all the signals and memos that are read within
/// the closure. If any of those dependencies change, the memo is marked stale
/// and recomputed the next time it is read.
///
/// Memos are **lazy**: the closure does not run until the first read, and a
/// stale memo recomputes at most once per read, no matter how many
/// dependencies changed in between. The output is compared with
/// [`PartialEq`]; subscribers are only notified if it actually changed.
///
/// # Example
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(0);
/// let double = create_memo(move || state.get() * 2);
///
/// assert_eq!(double.get(), 0);
/// state.set(1);
/// assert_eq!(double.get(), 2);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_memo<T: PartialEq + 'static>(mut f: impl FnMut() -> T + 'static) -> Memo<T> {
    create_memo_with_prev(move |_| f())
}

/// Like [`create_memo`], but the closure also receives the previously
/// computed value (`None` on the first run).
///
/// # Example
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// // Running total of every value `state` has been committed with.
/// let total = create_memo_with_prev(move |prev: Option<&i32>| {
///     prev.copied().unwrap_or(0) + state.get()
/// });
/// assert_eq!(total.get(), 1);
/// state.set(2);
/// assert_eq!(total.get(), 3);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_memo_with_prev<T: PartialEq + 'static>(
    mut f: impl FnMut(Option<&T>) -> T + 'static,
) -> Memo<T> {
    let root = Root::global();
    let compute = Box::new(move |slot: &mut Option<Box<dyn Any>>| {
        let prev = slot.as_ref().and_then(|value| value.downcast_ref::<T>());
        let new = f(prev);
        match slot {
            Some(old) if old.downcast_ref::<T>() == Some(&new) => false,
            _ => {
                *slot = Some(Box::new(new));
                true
            }
        }
    });
    let id = root.insert_node(
        NodeKind::Memo {
            value: None,
            compute: Some(compute),
        },
        NodeFlags::MUTABLE | NodeFlags::DIRTY,
    );
    Memo(ReadSignal::new(id, root))
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Memo<T> {}

impl<T> Deref for Memo<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for Memo<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for Memo<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Memo<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn memo() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_memo(move || state.get() * 2);

            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    /// Make sure the value is cached rather than recomputed on demand.
    #[test]
    fn memo_is_lazy_and_cached() {
        let _ = create_root(|| {
            let state = create_signal(0);

            let counter = create_signal(0);
            let double = create_memo(move || {
                counter.set_silent(counter.get_untracked() + 1);
                state.get() * 2
            });

            assert_eq!(counter.get(), 0); // nothing has read the memo yet
            assert_eq!(double.get(), 0);
            assert_eq!(counter.get(), 1);

            assert_eq!(double.get(), 0);
            assert_eq!(counter.get(), 1); // still 1 after another read

            state.set(2);
            assert_eq!(counter.get(), 1); // not recomputed until read

            assert_eq!(double.get(), 4);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn dependency_on_memo() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_memo(move || state.get() * 2);
            let quadruple = create_memo(move || double.get() * 2);

            assert_eq!(quadruple.get(), 0);
            state.set(1);
            assert_eq!(quadruple.get(), 4);
        });
    }

    #[test]
    fn untracked_memo() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_memo(move || state.get_untracked() * 2);

            assert_eq!(double.get(), 2);
            state.set(2);
            // Still the old value: state.get_untracked() did not subscribe.
            assert_eq!(double.get(), 2);
        });
    }

    #[test]
    fn memo_with_prev() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let total = create_memo_with_prev(move |prev: Option<&i32>| {
                prev.copied().unwrap_or(0) + state.get()
            });

            assert_eq!(total.get(), 1);
            state.set(2);
            assert_eq!(total.get(), 3);
            state.set(5);
            assert_eq!(total.get(), 8);
        });
    }

    #[test]
    fn memo_change_is_equality_gated() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let squared = create_memo(move || state.get() * state.get());
            let counter = create_signal(0);
            create_effect(move || {
                counter.set(counter.get_untracked() + 1);
                squared.track();
            });
            assert_eq!(counter.get(), 1);

            state.set(2);
            assert_eq!(squared.get(), 4);
            assert_eq!(counter.get(), 2);

            // The signal changes but the memo output does not.
            state.set(-2);
            assert_eq!(squared.get(), 4);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn memos_recreate_dependencies_each_run() {
        let _ = create_root(|| {
            let condition = create_signal(true);

            let state1 = create_signal(0);
            let state2 = create_signal(1);

            let counter = create_signal(0);
            let value = create_memo(move || {
                counter.set_silent(counter.get_untracked() + 1);

                if condition.get() {
                    state1.get()
                } else {
                    state2.get()
                }
            });
            let out = create_signal(-1);
            create_effect(move || {
                out.set(value.get());
            });

            assert_eq!(counter.get(), 1);

            state1.set(2);
            assert_eq!(counter.get(), 2);

            state2.set(2);
            assert_eq!(counter.get(), 2); // not tracked

            condition.set(false);
            assert_eq!(counter.get(), 3);

            state1.set(3);
            assert_eq!(counter.get(), 3); // not tracked

            state2.set(3);
            assert_eq!(counter.get(), 4); // tracked after condition.set
        });
    }
}
