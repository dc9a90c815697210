//! Reactive signals.

use std::any::Any;
use std::cell::Ref;
use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{AddAssign, Deref, DivAssign, MulAssign, RemAssign, SubAssign};

use slotmap::Key;

use crate::*;

/// A read-only reactive value.
///
/// Unlike the difference between Rust's shared and mutable-references (`&T`
/// and `&mut`), the underlying data is not immutable. The data can be updated
/// with the corresponding [`Signal`] (which has write access) and will show
/// up in the `ReadSignal` as well.
///
/// A `ReadSignal` can be simply obtained by dereferencing a [`Signal`]. In
/// fact, every [`Signal`] is a `ReadSignal` with additional write abilities!
///
/// # Example
/// ```
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let signal: Signal<i32> = create_signal(123);
/// let read_signal: ReadSignal<i32> = *signal;
/// assert_eq!(read_signal.get(), 123);
/// signal.set(456);
/// assert_eq!(read_signal.get(), 456);
/// // read_signal.set(789); // <-- This is not allowed!
/// # });
/// ```
///
/// See [`create_signal`] for more information.
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
    /// Keep track of where the signal was created for diagnostics.
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// A reactive value that can be read and written to.
///
/// This is the writable analog of [`ReadSignal`].
///
/// See [`create_signal`] for more information.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Create a new [`Signal`].
///
/// Signals are reactive atoms, pieces of state that can be read and written
/// to and which will automatically update anything which depends on them.
///
/// # Usage
/// The simplest way to use a signal is with [`.get()`](ReadSignal::get) and
/// [`.set(...)`](Signal::set). However, `get` only works if the value
/// implements [`Copy`]. For something that only implements [`Clone`], say a
/// [`String`], use [`.get_clone()`](ReadSignal::get_clone) instead, or access
/// the value in place with [`.with(...)`](ReadSignal::with).
///
/// ```rust
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let signal = create_signal(1);
/// signal.get(); // Should return 1.
/// signal.set(2);
/// signal.get(); // Should return 2.
/// # });
/// ```
///
/// # Reactivity
/// Accessing a signal inside a tracked context (a memo or an effect) adds it
/// as a dependency of that context:
///
/// ```rust
/// # use glint_reactive::*;
/// # let _ = create_root(|| {
/// let signal = create_signal(1);
/// // `signal` is accessed inside the closure below, so the memo tracks it
/// // and recomputes whenever `signal` changes.
/// let double = create_memo(move || signal.get() * 2);
/// assert_eq!(double.get(), 2);
/// signal.set(2);
/// assert_eq!(double.get(), 4);
/// # });
/// ```
///
/// Writes are equality-gated: setting a signal to a value equal to the
/// current one does not notify anything, which is why `T` must implement
/// [`PartialEq`].
///
/// # Ownership
/// The value of the signal lives in the current reactive root. What is
/// returned from this function is just a small `Copy` handle, which can be
/// freely copied into closures and event handlers without worrying about
/// ownership of the underlying value.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T: PartialEq + 'static>(value: T) -> Signal<T> {
    let root = Root::global();
    let id = root.insert_node(
        NodeKind::Signal {
            value: Some(Box::new(value)),
            previous: None,
            changed: signal_changed::<T>,
        },
        NodeFlags::MUTABLE,
    );
    Signal(ReadSignal::new(id, root))
}

impl<T> ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn new(id: NodeId, root: &'static Root) -> Self {
        Self {
            id,
            root,
            #[cfg(debug_assertions)]
            created_at: std::panic::Location::caller(),
            _phantom: PhantomData,
        }
    }

    /// Get an immutable reference to the underlying node.
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_ref(self) -> Ref<'static, ReactiveNode> {
        Ref::map(self.root.nodes.borrow(), |nodes| match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.disposed_panic_message()),
        })
    }

    pub(crate) fn disposed_panic_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "signal was disposed".to_string();

        #[cfg(debug_assertions)]
        return format!("signal was disposed. Created at {}", self.created_at);
    }

    /// Get the value of the signal without tracking it. The type must
    /// implement [`Copy`]. If this is not the case, use
    /// [`ReadSignal::get_clone_untracked`] or [`ReadSignal::with_untracked`]
    /// instead.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Get the value of the signal without tracking it. The type is
    /// [`Clone`]-ed automatically.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get the value of the signal. The type must implement [`Copy`]. If this
    /// is not the case, use [`ReadSignal::get_clone`] or [`ReadSignal::with`]
    /// instead.
    ///
    /// When called inside a tracked context, the signal is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Get the value of the signal. The type is [`Clone`]-ed automatically.
    ///
    /// When called inside a tracked context, the signal is automatically
    /// tracked.
    ///
    /// If the value implements [`Copy`], you should use [`ReadSignal::get`]
    /// instead.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Get a value from the signal without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.root.refresh_node(self.id);
        let node = self.get_ref();
        let value: &dyn Any = match &node.kind {
            NodeKind::Signal { value, .. } => value.as_ref().expect("value updating").as_ref(),
            NodeKind::Memo { value, .. } => value.as_ref().expect("value updating").as_ref(),
            _ => unreachable!("read handle on a subscriber node"),
        };
        f(value.downcast_ref().expect("wrong signal type"))
    }

    /// Get a value from the signal.
    ///
    /// When called inside a tracked context, the signal is automatically
    /// tracked.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Track the signal in the current tracked context. This is done
    /// automatically when calling [`ReadSignal::get`] and other similar
    /// methods.
    ///
    /// Brings the value up to date (committing a pending write or refreshing
    /// a stale memo) even when nothing is tracking.
    pub fn track(self) {
        self.root.refresh_node(self.id);
        self.root.track_node(self.id);
    }

    /// Returns `true` if anything (a memo, an effect, or a scope) currently
    /// subscribes to this value.
    pub fn has_subscribers(self) -> bool {
        !self.get_ref().subs.is_null()
    }
}

impl<T> Signal<T> {
    /// Take the signal's value out of the node for the duration of `f`.
    ///
    /// Reading the signal while the value is out panics, so `f` must not
    /// re-enter this signal.
    fn with_value_taken<U>(self, f: impl FnOnce(&mut Box<dyn Any>) -> U) -> U {
        let mut value = {
            let mut nodes = self.root.nodes.borrow_mut();
            let node = match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.0.disposed_panic_message()),
            };
            match &mut node.kind {
                NodeKind::Signal { value, .. } => value.take().expect("value updating"),
                _ => unreachable!("write handle on a non-signal node"),
            }
        };
        let ret = f(&mut value);
        let mut nodes = self.root.nodes.borrow_mut();
        if let Some(node) = nodes.get_mut(self.id) {
            if let NodeKind::Signal { value: slot, .. } = &mut node.kind {
                *slot = Some(value);
            }
        }
        ret
    }

    /// Record `old` as the committed baseline, unless an earlier write
    /// already did.
    fn keep_previous(self, old: T) {
        let mut nodes = self.root.nodes.borrow_mut();
        if let Some(node) = nodes.get_mut(self.id) {
            if let NodeKind::Signal { previous, .. } = &mut node.kind {
                if previous.is_none() {
                    *previous = Some(Box::new(old));
                }
            }
        }
    }

    /// Set a new value for the signal and automatically update any
    /// dependents.
    ///
    /// Setting a value equal (by [`PartialEq`]) to the current one is a
    /// complete no-op: nothing is notified, no effect re-runs.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T)
    where
        T: PartialEq,
    {
        let notify = {
            let mut nodes = self.root.nodes.borrow_mut();
            let node = match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.0.disposed_panic_message()),
            };
            match &mut node.kind {
                NodeKind::Signal {
                    value, previous, ..
                } => {
                    let stored = value
                        .as_mut()
                        .expect("value updating")
                        .downcast_mut::<T>()
                        .expect("wrong signal type");
                    if *stored == new {
                        false
                    } else {
                        let old = std::mem::replace(stored, new);
                        if previous.is_none() {
                            *previous = Some(Box::new(old));
                        }
                        true
                    }
                }
                _ => unreachable!("write handle on a non-signal node"),
            }
        };
        if notify {
            self.root.notify_write(self.id);
        }
    }

    /// Silently set a new value for the signal. This will not trigger any
    /// updates in dependents. As such, this is generally not recommended as
    /// it can easily lead to state inconsistencies.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_silent(self, new: T) {
        self.replace_silent(new);
    }

    /// Set a new value for the signal and return the previous value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T
    where
        T: Clone + PartialEq,
    {
        self.update(|value| std::mem::replace(value, new))
    }

    /// Silently set a new value for the signal and return the previous value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace_silent(self, new: T) -> T {
        self.update_silent(|value| std::mem::replace(value, new))
    }

    /// Replace the value with [`Default::default()`], notifying dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take(self) -> T
    where
        T: Clone + PartialEq + Default,
    {
        self.replace(T::default())
    }

    /// Replace the value with [`Default::default()`] without notifying
    /// dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take_silent(self) -> T
    where
        T: Default,
    {
        self.replace_silent(T::default())
    }

    /// Update the value of the signal in place and notify dependents if the
    /// value actually changed.
    ///
    /// The old value is kept around for the change comparison, which is why
    /// `T` must implement [`Clone`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update<U>(self, f: impl FnOnce(&mut T) -> U) -> U
    where
        T: Clone + PartialEq,
    {
        let (ret, changed) = self.with_value_taken(|value| {
            let typed = value.downcast_mut::<T>().expect("wrong signal type");
            let old = typed.clone();
            let ret = f(&mut *typed);
            let changed = *typed != old;
            (ret, changed.then_some(old))
        });
        if let Some(old) = changed {
            self.keep_previous(old);
            self.root.notify_write(self.id);
        }
        ret
    }

    /// Update the value of the signal in place without notifying dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update_silent<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        self.with_value_taken(|value| f(value.downcast_mut().expect("wrong signal type")))
    }

    /// Set the value from a function of the current value, notifying
    /// dependents on change.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn(self, f: impl FnOnce(&T) -> T)
    where
        T: Clone + PartialEq,
    {
        self.update(move |value| *value = f(value));
    }

    /// Set the value from a function of the current value without notifying
    /// dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn_silent(self, f: impl FnOnce(&T) -> T) {
        self.update_silent(move |value| *value = f(value));
    }

    /// Derive a [`Memo`] from this signal.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn map<U: PartialEq + 'static>(self, mut f: impl FnMut(&T) -> U + 'static) -> Memo<U> {
        create_memo(move || self.with(&mut f))
    }

    /// Split the signal into a read half and a setter function.
    pub fn split(self) -> (ReadSignal<T>, impl Fn(T) -> T)
    where
        T: Clone + PartialEq,
    {
        (*self, move |value| self.replace(value))
    }
}

/// We manually implement `Clone` + `Copy` for `ReadSignal` so that we don't
/// get extra bounds on `T`.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

// Implement `Default` for `ReadSignal` and `Signal`.
impl<T: Default + PartialEq> Default for ReadSignal<T> {
    fn default() -> Self {
        *create_signal(Default::default())
    }
}
impl<T: Default + PartialEq> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}

// Forward `PartialEq`, `Eq`, `PartialOrd`, `Ord`, `Hash` from the inner type.
impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}
impl<T: PartialOrd> PartialOrd for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Signal<T> {}
impl<T: PartialOrd> PartialOrd for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Formatting implementations for `ReadSignal` and `Signal`.
impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

// Serde implementations for `ReadSignal` and `Signal`.
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for ReadSignal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(*create_signal(T::deserialize(deserializer)?))
    }
}
#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Signal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for Signal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_signal(T::deserialize(deserializer)?))
    }
}

#[cfg(feature = "nightly")]
impl<T: Copy> FnOnce<()> for ReadSignal<T> {
    type Output = T;

    extern "rust-call" fn call_once(self, _args: ()) -> Self::Output {
        self.get()
    }
}

impl<T: AddAssign<Rhs> + Clone + PartialEq, Rhs> AddAssign<Rhs> for Signal<T> {
    fn add_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this += rhs);
    }
}
impl<T: SubAssign<Rhs> + Clone + PartialEq, Rhs> SubAssign<Rhs> for Signal<T> {
    fn sub_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this -= rhs);
    }
}
impl<T: MulAssign<Rhs> + Clone + PartialEq, Rhs> MulAssign<Rhs> for Signal<T> {
    fn mul_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this *= rhs);
    }
}
impl<T: DivAssign<Rhs> + Clone + PartialEq, Rhs> DivAssign<Rhs> for Signal<T> {
    fn div_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this /= rhs);
    }
}
impl<T: RemAssign<Rhs> + Clone + PartialEq, Rhs> RemAssign<Rhs> for Signal<T> {
    fn rem_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this %= rhs);
    }
}

// We need to implement this again for `Signal` despite `Signal` deref-ing to
// `ReadSignal` since we also have another implementation of `FnOnce` for
// `Signal`.
#[cfg(feature = "nightly")]
impl<T: Copy> FnOnce<()> for Signal<T> {
    type Output = T;

    extern "rust-call" fn call_once(self, _args: ()) -> Self::Output {
        self.get()
    }
}

#[cfg(feature = "nightly")]
impl<T: Copy + PartialEq> FnOnce<(T,)> for Signal<T> {
    type Output = T;

    extern "rust-call" fn call_once(self, (val,): (T,)) -> Self::Output {
        self.replace(val)
    }
}
