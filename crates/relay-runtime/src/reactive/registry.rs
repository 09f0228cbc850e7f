#![forbid(unsafe_code)]

//! Cancellable, label-aware subscription list.
//!
//! # Design
//!
//! A [`SubscriptionRegistry<A, R>`] keeps an ordered list of callbacks
//! `Fn(&A) -> R`. Callbacks join the list in one of two ways:
//!
//! - [`subscribe`](SubscriptionRegistry::subscribe) appends immediately.
//! - [`subscribe_deferred_reversed`](SubscriptionRegistry::subscribe_deferred_reversed)
//!   parks the callback in a pending queue. At the end of the turn the whole
//!   queue is appended in **reverse** arrival order. Consumers registered in
//!   one synchronous pass (a selector and the selectors derived from it) are
//!   therefore notified most-derived first.
//!
//! Every registration returns a [`Subscription`] guard. Dropping the guard or
//! calling [`Subscription::unsubscribe`] cancels the callback; both are
//! idempotent.
//!
//! # Invariants
//!
//! 1. `broadcast` invokes live callbacks in list order, exactly once each.
//! 2. `broadcast` iterates a snapshot: callbacks added during a pass are not
//!    invoked in that pass, and cancellations only ever skip the cancelled
//!    entry.
//! 3. A cancelled entry is tombstoned immediately and compacted out once no
//!    broadcast is in flight.
//! 4. Several deferred registrations in one turn share a single pending flush.
//!    The flush keeps its place in the scheduler queue once armed.
//! 5. A deferred entry cancelled before the flush never reaches the live list.
//! 6. Join hooks run once, after the flush, in notification order, and never
//!    for an entry cancelled before its hook runs.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use relay_core::{Scheduler, SubscriptionToken, TaskId};

type Callback<A, R> = Rc<dyn Fn(&A) -> R>;
type JoinHook = Box<dyn FnOnce()>;

struct Entry<A, R> {
    token: SubscriptionToken,
    callback: Callback<A, R>,
    cancelled: Cell<bool>,
    label: Option<String>,
    on_join: RefCell<Option<JoinHook>>,
}

struct RegistryInner<A, R> {
    next_token: u64,
    live: Vec<Rc<Entry<A, R>>>,
    deferred: Vec<Rc<Entry<A, R>>>,
    flush_task: Option<TaskId>,
    /// Depth of in-flight broadcasts; compaction waits until it is zero.
    broadcasting: usize,
}

/// Ordered list of callbacks with immediate and deferred-reversed
/// registration.
///
/// Cloning a registry creates a new handle to the **same** list.
pub struct SubscriptionRegistry<A, R = ()> {
    inner: Rc<RefCell<RegistryInner<A, R>>>,
    scheduler: Scheduler,
}

impl<A, R> Clone for SubscriptionRegistry<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<A, R> fmt::Debug for SubscriptionRegistry<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SubscriptionRegistry")
            .field("live", &inner.live.len())
            .field("deferred", &inner.deferred.len())
            .field("flush_pending", &inner.flush_task.is_some())
            .finish()
    }
}

impl<A: 'static, R: 'static> SubscriptionRegistry<A, R> {
    #[must_use]
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                next_token: 0,
                live: Vec::new(),
                deferred: Vec::new(),
                flush_task: None,
                broadcasting: 0,
            })),
            scheduler: scheduler.clone(),
        }
    }

    fn make_entry(
        inner: &mut RegistryInner<A, R>,
        callback: impl Fn(&A) -> R + 'static,
        label: Option<&str>,
    ) -> Rc<Entry<A, R>> {
        inner.next_token += 1;
        Rc::new(Entry {
            token: SubscriptionToken(inner.next_token),
            callback: Rc::new(callback),
            cancelled: Cell::new(false),
            label: label.map(str::to_owned),
            on_join: RefCell::new(None),
        })
    }

    fn guard(&self, token: SubscriptionToken) -> Subscription {
        let weak: Weak<RefCell<RegistryInner<A, R>>> = Rc::downgrade(&self.inner);
        Subscription::new(token, move || {
            if let Some(inner) = weak.upgrade() {
                unsubscribe_entry(&inner, token);
            }
        })
    }

    /// Append `callback` to the live list.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe(
        &self,
        callback: impl Fn(&A) -> R + 'static,
        label: Option<&str>,
    ) -> Subscription {
        let token = {
            let mut inner = self.inner.borrow_mut();
            let entry = Self::make_entry(&mut inner, callback, label);
            let token = entry.token;
            inner.live.push(entry);
            token
        };
        self.guard(token)
    }

    /// Park `callback` until the end of the turn, then append it together
    /// with every other parked callback in reverse arrival order.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe_deferred_reversed(
        &self,
        callback: impl Fn(&A) -> R + 'static,
        label: Option<&str>,
    ) -> Subscription {
        self.park(callback, label, None)
    }

    /// Like [`subscribe_deferred_reversed`](Self::subscribe_deferred_reversed),
    /// running `on_join` once the callback has joined the live list. Owners
    /// use the hook to replay whatever was broadcast while the entry waited.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe_deferred_reversed_with(
        &self,
        callback: impl Fn(&A) -> R + 'static,
        label: Option<&str>,
        on_join: impl FnOnce() + 'static,
    ) -> Subscription {
        self.park(callback, label, Some(Box::new(on_join)))
    }

    fn park(
        &self,
        callback: impl Fn(&A) -> R + 'static,
        label: Option<&str>,
        on_join: Option<JoinHook>,
    ) -> Subscription {
        let (token, needs_flush) = {
            let mut inner = self.inner.borrow_mut();
            let entry = Self::make_entry(&mut inner, callback, label);
            *entry.on_join.borrow_mut() = on_join;
            let token = entry.token;
            inner.deferred.push(entry);
            (token, inner.flush_task.is_none())
        };
        if needs_flush {
            let weak = Rc::downgrade(&self.inner);
            let task = self.scheduler.schedule(move || {
                if let Some(inner) = weak.upgrade() {
                    flush_pending(&inner);
                }
            });
            self.inner.borrow_mut().flush_task = Some(task);
        }
        self.guard(token)
    }

    /// Cancel the subscription identified by `token`.
    ///
    /// Returns `false` if it was already cancelled or never existed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        unsubscribe_entry(&self.inner, token)
    }

    /// Run the pending reversed flush now instead of at the end of the turn.
    pub fn flush_deferred(&self) -> usize {
        let task = self.inner.borrow_mut().flush_task.take();
        if let Some(task) = task {
            self.scheduler.cancel(task);
        }
        flush_pending(&self.inner)
    }

    /// Invoke every live callback with `args`, in list order.
    pub fn broadcast(&self, args: &A) -> Vec<R> {
        let snapshot: Vec<Rc<Entry<A, R>>> = {
            let mut inner = self.inner.borrow_mut();
            inner.broadcasting += 1;
            inner.live.clone()
        };
        let _guard = BroadcastGuard { inner: &self.inner };
        tracing::trace!(message = "registry.broadcast", subscribers = snapshot.len());

        let mut results = Vec::with_capacity(snapshot.len());
        for entry in &snapshot {
            if entry.cancelled.get() {
                continue;
            }
            results.push((entry.callback)(args));
        }
        results
    }

    /// Drop every entry, live and pending.
    pub fn clear(&self) {
        let (removed, task) = {
            let mut inner = self.inner.borrow_mut();
            let mut removed = std::mem::take(&mut inner.live);
            removed.append(&mut inner.deferred);
            for entry in &removed {
                entry.cancelled.set(true);
            }
            (removed, inner.flush_task.take())
        };
        if let Some(task) = task {
            self.scheduler.cancel(task);
        }
        drop(removed);
    }

    /// Number of live, non-cancelled subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .borrow()
            .live
            .iter()
            .filter(|e| !e.cancelled.get())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callbacks waiting for the reversed flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.borrow().deferred.len()
    }

    /// Labels of live subscribers, in notification order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.inner
            .borrow()
            .live
            .iter()
            .filter(|e| !e.cancelled.get())
            .filter_map(|e| e.label.clone())
            .collect()
    }
}

fn flush_pending<A, R>(inner: &RefCell<RegistryInner<A, R>>) -> usize {
    // Cancelled entries are released only after the borrow ends: a callback
    // may own a guard for another entry of this registry.
    let (joined, _cancelled) = {
        let mut inner = inner.borrow_mut();
        inner.flush_task = None;
        let pending = std::mem::take(&mut inner.deferred);
        let (cancelled, joining): (Vec<_>, Vec<_>) =
            pending.into_iter().rev().partition(|e| e.cancelled.get());
        inner.live.extend(joining.iter().cloned());
        (joining, cancelled)
    };
    let flushed = joined.len();
    tracing::trace!(message = "registry.flush", flushed);
    for entry in &joined {
        if entry.cancelled.get() {
            continue;
        }
        let hook = entry.on_join.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
    }
    flushed
}

/// Remove tombstoned entries from the live list and hand them back so the
/// caller can drop them with no borrow held.
fn compact<A, R>(inner: &mut RegistryInner<A, R>) -> Vec<Rc<Entry<A, R>>> {
    let (dead, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.live)
        .into_iter()
        .partition(|e| e.cancelled.get());
    inner.live = kept;
    dead
}

fn unsubscribe_entry<A, R>(inner: &RefCell<RegistryInner<A, R>>, token: SubscriptionToken) -> bool {
    let (found, _removed) = {
        let mut inner = inner.borrow_mut();
        if let Some(pos) = inner.deferred.iter().position(|e| e.token == token) {
            let entry = inner.deferred.remove(pos);
            entry.cancelled.set(true);
            (true, vec![entry])
        } else if let Some(entry) = inner
            .live
            .iter()
            .find(|e| e.token == token && !e.cancelled.get())
        {
            entry.cancelled.set(true);
            let removed = if inner.broadcasting == 0 {
                compact(&mut inner)
            } else {
                Vec::new()
            };
            (true, removed)
        } else {
            (false, Vec::new())
        }
    };
    found
}

/// Closes a broadcast pass and compacts tombstones, even on unwind.
struct BroadcastGuard<'a, A, R> {
    inner: &'a RefCell<RegistryInner<A, R>>,
}

impl<A, R> Drop for BroadcastGuard<'_, A, R> {
    fn drop(&mut self) {
        let _removed = {
            let mut inner = self.inner.borrow_mut();
            inner.broadcasting -= 1;
            if inner.broadcasting == 0 {
                compact(&mut inner)
            } else {
                Vec::new()
            }
        };
    }
}

/// Guard for a registered callback.
///
/// Dropping the guard cancels the callback. [`detach`](Self::detach) disarms
/// the guard and hands back the token for an explicit
/// [`SubscriptionRegistry::unsubscribe`] later.
pub struct Subscription {
    token: SubscriptionToken,
    cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    fn new(token: SubscriptionToken, cancel: impl FnOnce() + 'static) -> Self {
        Self {
            token,
            cancel: RefCell::new(Some(Box::new(cancel))),
        }
    }

    #[must_use]
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// Cancel the callback. Calling this more than once does nothing.
    pub fn unsubscribe(&self) {
        let cancel = self.cancel.borrow_mut().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Whether this guard still owns an uncancelled callback.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.cancel.borrow().is_some()
    }

    /// Keep the callback registered past the guard's lifetime.
    #[must_use]
    pub fn detach(self) -> SubscriptionToken {
        self.cancel.borrow_mut().take();
        self.token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("armed", &self.is_armed())
            .finish()
    }
}
