#![forbid(unsafe_code)]

//! Per-provider latest-value store with equality-gated broadcast.
//!
//! # Design
//!
//! A [`ProviderStore<D>`] owns one logical value stream. Every provider
//! registered on it gets a [`ProviderId`], a slot for its latest committed
//! tuple `D`, an optional temp slot, and a dedicated
//! [`SubscriptionRegistry`]. Tuples are plain Rust tuples (or any
//! `Clone + PartialEq` type); the default gate compares them slot-wise.
//!
//! Publication comes in two flavours:
//!
//! - [`update_value`](ProviderStore::update_value) commits synchronously. The
//!   very first value for an id is stored silently; later values broadcast
//!   only when the store's equality reports a change.
//! - [`use_update_value`](ProviderStore::use_update_value) writes the temp
//!   slot, which reads see immediately, and leaves the commit (gate and
//!   broadcast) to the host's commit hook
//!   ([`commit_pending`](ProviderStore::commit_pending)) or to the end of the
//!   turn.
//!
//! Each store also owns a **default provider**, registered at construction.
//! Reading it pulls from the default value getter and publishes through the
//! ordinary update path, so consumers without a mounted provider still see
//! default changes.
//!
//! # Invariants
//!
//! 1. Ids increase monotonically per store and are never reused.
//! 2. Publishing an equal tuple twice broadcasts at most once.
//! 3. Reads prefer the temp slot over the committed slot.
//! 4. `destroy` never removes state synchronously; storage is purged
//!    [`StoreConfig::destroy_delay_turns`] turns later unless
//!    [`restore`](ProviderStore::restore) intervenes.
//! 5. No store borrow is held while user callbacks or equality run.
//! 6. A deferred subscriber that joins after a broadcast it missed is handed
//!    the committed value once, right after it joins.
//!
//! # Failure Modes
//!
//! - Reading before the first commit: [`ContextError::UninitializedAccess`].
//! - Reading the default provider without a default value:
//!   [`ContextError::MissingDefaultValue`].
//! - Touching an id after its purge: [`ContextError::ProviderDestroyed`].

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use relay_core::{ContextError, ProviderId, Result, Scheduler, TaskId};

use super::registry::{Subscription, SubscriptionRegistry};

type Compare<D> = Rc<dyn Fn(&D, &D) -> bool>;
type DefaultGetter<D> = Rc<dyn Fn() -> Option<D>>;

/// Configuration for a [`ProviderStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Name attached to this store's log events.
    /// Default: none.
    pub label: Option<String>,

    /// Turns between `destroy` and the purge of a provider's storage.
    /// Default: 1.
    pub destroy_delay_turns: u32,

    /// Whether `use_update_value` also queues its commit for the end of the
    /// turn, in addition to the host calling `commit_pending`.
    /// Default: true.
    pub commit_at_turn_end: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            label: None,
            destroy_delay_turns: 1,
            commit_at_turn_end: true,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_destroy_delay_turns(mut self, turns: u32) -> Self {
        self.destroy_delay_turns = turns;
        self
    }

    #[must_use]
    pub fn with_commit_at_turn_end(mut self, enabled: bool) -> Self {
        self.commit_at_turn_end = enabled;
        self
    }
}

struct StoreInner<D> {
    config: StoreConfig,
    counter: u64,
    committed: AHashMap<ProviderId, D>,
    temp: AHashMap<ProviderId, D>,
    /// Bumped on every broadcasting commit.
    versions: AHashMap<ProviderId, u64>,
    registries: AHashMap<ProviderId, SubscriptionRegistry<D>>,
    /// Providers with a purge queued, keyed to the purge task.
    destroying: AHashMap<ProviderId, TaskId>,
    commit_task: Option<TaskId>,
    equality: Compare<D>,
    default_getter: Option<DefaultGetter<D>>,
    default_provider: ProviderId,
}

/// Owner of one logical value stream and all of its providers.
///
/// Cloning a `ProviderStore` creates a new handle to the **same** state.
pub struct ProviderStore<D> {
    inner: Rc<RefCell<StoreInner<D>>>,
    scheduler: Scheduler,
}

impl<D> Clone for ProviderStore<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<D> fmt::Debug for ProviderStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ProviderStore")
            .field("label", &inner.config.label)
            .field("providers", &inner.registries.len())
            .field("committed", &inner.committed.len())
            .field("pending_commits", &inner.temp.len())
            .field("destroying", &inner.destroying.len())
            .finish()
    }
}

impl<D: Clone + PartialEq + 'static> ProviderStore<D> {
    #[must_use]
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::with_config(scheduler, StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(scheduler: &Scheduler, config: StoreConfig) -> Self {
        let default_provider = ProviderId::new(1);
        let mut registries = AHashMap::new();
        registries.insert(default_provider, SubscriptionRegistry::new(scheduler));
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                config,
                counter: default_provider.raw(),
                committed: AHashMap::new(),
                temp: AHashMap::new(),
                versions: AHashMap::new(),
                registries,
                destroying: AHashMap::new(),
                commit_task: None,
                equality: Rc::new(|prev: &D, next: &D| prev == next),
                default_getter: None,
                default_provider,
            })),
            scheduler: scheduler.clone(),
        }
    }

    /// Replace the gate used by `update_value`.
    #[must_use]
    pub fn with_equality(self, equality: impl Fn(&D, &D) -> bool + 'static) -> Self {
        self.inner.borrow_mut().equality = Rc::new(equality);
        self
    }

    #[must_use]
    pub fn with_default_value(self, value: D) -> Self {
        self.with_default_value_getter(move || Some(value.clone()))
    }

    /// Install the getter consulted when the default provider is read.
    /// Returning `None` means "no default".
    #[must_use]
    pub fn with_default_value_getter(self, getter: impl Fn() -> Option<D> + 'static) -> Self {
        self.inner.borrow_mut().default_getter = Some(Rc::new(getter));
        self
    }

    /// Replace the default value and notify consumers of the default provider.
    pub fn set_default_value(&self, value: D) -> Result<()> {
        self.set_default_value_getter(move || Some(value.clone()))
    }

    /// Replace the default getter and notify consumers of the default
    /// provider if the value it yields changed.
    pub fn set_default_value_getter(&self, getter: impl Fn() -> Option<D> + 'static) -> Result<()> {
        self.inner.borrow_mut().default_getter = Some(Rc::new(getter));
        match self.refresh_default() {
            Ok(_) | Err(ContextError::MissingDefaultValue) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.inner.borrow().config.clone()
    }

    /// Allocate a new provider with its own registry.
    pub fn register_provider(&self) -> ProviderHandle<D> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.counter += 1;
            let id = ProviderId::new(inner.counter);
            inner
                .registries
                .insert(id, SubscriptionRegistry::new(&self.scheduler));
            tracing::debug!(
                message = "store.register",
                store = ?inner.config.label,
                provider = id.raw()
            );
            id
        };
        self.handle(id)
    }

    /// The provider consulted when no other provider is in scope.
    #[must_use]
    pub fn default_provider(&self) -> ProviderHandle<D> {
        let id = self.inner.borrow().default_provider;
        self.handle(id)
    }

    fn handle(&self, id: ProviderId) -> ProviderHandle<D> {
        ProviderHandle {
            id,
            store: self.clone(),
        }
    }

    fn registry(&self, id: ProviderId) -> Result<SubscriptionRegistry<D>> {
        self.inner
            .borrow()
            .registries
            .get(&id)
            .cloned()
            .ok_or(ContextError::ProviderDestroyed { provider: id })
    }

    /// Commit `value` for `id`, broadcasting if it differs from the
    /// previous committed value.
    pub fn update_value(&self, id: ProviderId, value: D) -> Result<()> {
        let registry = self.registry(id)?;
        let (previous, equality) = {
            let mut inner = self.inner.borrow_mut();
            // A direct commit supersedes any pending temp value.
            inner.temp.remove(&id);
            (inner.committed.get(&id).cloned(), Rc::clone(&inner.equality))
        };
        let changed = match &previous {
            None => false,
            Some(previous) => !equality(previous, &value),
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.committed.insert(id, value.clone());
            if changed {
                *inner.versions.entry(id).or_default() += 1;
            }
        }
        if changed {
            registry.broadcast(&value);
        }
        Ok(())
    }

    /// Make `value` readable now and commit it later.
    pub fn use_update_value(&self, id: ProviderId, value: D) -> Result<()> {
        self.registry(id)?;
        let schedule = {
            let mut inner = self.inner.borrow_mut();
            inner.temp.insert(id, value);
            inner.config.commit_at_turn_end && inner.commit_task.is_none()
        };
        if schedule {
            let weak: Weak<RefCell<StoreInner<D>>> = Rc::downgrade(&self.inner);
            let scheduler = self.scheduler.clone();
            let task = self.scheduler.schedule(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let store = ProviderStore { inner, scheduler };
                if let Err(err) = store.commit_pending() {
                    tracing::warn!(message = "store.commit_failed", error = %err);
                }
            });
            self.inner.borrow_mut().commit_task = Some(task);
        }
        Ok(())
    }

    /// Promote every temp value to committed. Returns how many were committed.
    pub fn commit_pending(&self) -> Result<usize> {
        let (mut pending, task) = {
            let mut inner = self.inner.borrow_mut();
            let pending: Vec<(ProviderId, D)> = inner.temp.drain().collect();
            (pending, inner.commit_task.take())
        };
        if let Some(task) = task {
            self.scheduler.cancel(task);
        }
        pending.sort_by_key(|(id, _)| *id);
        let count = pending.len();
        for (id, value) in pending {
            self.update_value(id, value)?;
        }
        if count > 0 {
            tracing::debug!(message = "store.commit", committed = count);
        }
        Ok(count)
    }

    /// Temp value if one is pending, else the committed value.
    pub fn latest_value(&self, id: ProviderId) -> Result<D> {
        let is_default = {
            let inner = self.inner.borrow();
            if let Some(value) = inner.temp.get(&id).or_else(|| inner.committed.get(&id)) {
                if id != inner.default_provider {
                    return Ok(value.clone());
                }
            }
            if id != inner.default_provider && !inner.registries.contains_key(&id) {
                return Err(ContextError::ProviderDestroyed { provider: id });
            }
            id == inner.default_provider
        };
        if is_default {
            return self.refresh_default();
        }
        Err(ContextError::UninitializedAccess { provider: id })
    }

    fn refresh_default(&self) -> Result<D> {
        let (getter, id) = {
            let inner = self.inner.borrow();
            (inner.default_getter.clone(), inner.default_provider)
        };
        let value = getter
            .and_then(|getter| getter())
            .ok_or(ContextError::MissingDefaultValue)?;
        self.update_value(id, value.clone())?;
        Ok(value)
    }

    /// Queue the purge of `id`'s storage. Destroying twice, or destroying
    /// the default provider, does nothing.
    pub fn destroy(&self, id: ProviderId) {
        let delay = {
            let inner = self.inner.borrow();
            if id == inner.default_provider
                || inner.destroying.contains_key(&id)
                || !inner.registries.contains_key(&id)
            {
                return;
            }
            inner.config.destroy_delay_turns
        };
        let weak = Rc::downgrade(&self.inner);
        let task = self.scheduler.schedule_after_turns(delay, move || {
            if let Some(inner) = weak.upgrade() {
                purge(&inner, id);
            }
        });
        let mut inner = self.inner.borrow_mut();
        inner.destroying.insert(id, task);
        tracing::debug!(
            message = "store.destroy",
            store = ?inner.config.label,
            provider = id.raw(),
            delay_turns = delay
        );
    }

    /// Cancel a queued purge, keeping the provider's buffered state.
    pub fn restore(&self, id: ProviderId) -> bool {
        let task = self.inner.borrow_mut().destroying.remove(&id);
        let Some(task) = task else {
            return false;
        };
        self.scheduler.cancel(task);
        tracing::debug!(message = "store.restore", provider = id.raw());
        true
    }

    /// Whether `id` has been destroyed (purge queued or done).
    #[must_use]
    pub fn is_destroyed(&self, id: ProviderId) -> bool {
        let inner = self.inner.borrow();
        inner.destroying.contains_key(&id) || !inner.registries.contains_key(&id)
    }

    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe(
        &self,
        id: ProviderId,
        callback: impl Fn(&D) + 'static,
        label: Option<&str>,
    ) -> Result<Subscription> {
        Ok(self.registry(id)?.subscribe(callback, label))
    }

    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe_deferred_reversed(
        &self,
        id: ProviderId,
        callback: impl Fn(&D) + 'static,
        label: Option<&str>,
    ) -> Result<Subscription> {
        let registry = self.registry(id)?;
        let seen = self.version(id);
        let callback: Rc<dyn Fn(&D)> = Rc::new(callback);
        let replay = Rc::clone(&callback);
        let weak = Rc::downgrade(&self.inner);
        Ok(registry.subscribe_deferred_reversed_with(
            move |value: &D| callback(value),
            label,
            move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let missed = {
                    let inner = inner.borrow();
                    let version = inner.versions.get(&id).copied().unwrap_or(0);
                    if version == seen {
                        None
                    } else {
                        inner.committed.get(&id).cloned()
                    }
                };
                if let Some(value) = missed {
                    tracing::trace!(message = "store.replay", provider = id.raw());
                    replay(&value);
                }
            },
        ))
    }

    /// Count of broadcasting commits for `id` so far.
    #[must_use]
    pub fn version(&self, id: ProviderId) -> u64 {
        self.inner.borrow().versions.get(&id).copied().unwrap_or(0)
    }

    /// Providers with live storage, the default provider included.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.inner.borrow().registries.len()
    }

    /// Live subscribers of `id` (zero once purged).
    #[must_use]
    pub fn subscriber_count(&self, id: ProviderId) -> usize {
        self.registry(id).map_or(0, |registry| registry.len())
    }
}

fn purge<D: 'static>(inner: &RefCell<StoreInner<D>>, id: ProviderId) {
    let registry = {
        let mut inner = inner.borrow_mut();
        inner.destroying.remove(&id);
        inner.committed.remove(&id);
        inner.temp.remove(&id);
        inner.versions.remove(&id);
        inner.registries.remove(&id)
    };
    if let Some(registry) = registry {
        registry.clear();
    }
    tracing::debug!(message = "store.purge", provider = id.raw());
}

/// One live publication point, as handed to the host on provider mount.
pub struct ProviderHandle<D> {
    id: ProviderId,
    store: ProviderStore<D>,
}

impl<D> Clone for ProviderHandle<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            store: self.store.clone(),
        }
    }
}

impl<D> fmt::Debug for ProviderHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle").field("id", &self.id).finish()
    }
}

impl<D> ProviderHandle<D> {
    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.id
    }

    #[must_use]
    pub fn store(&self) -> &ProviderStore<D> {
        &self.store
    }
}

impl<D: Clone + PartialEq + 'static> ProviderHandle<D> {

    pub fn latest_value(&self) -> Result<D> {
        self.store.latest_value(self.id)
    }

    pub fn update_value(&self, value: D) -> Result<()> {
        self.store.update_value(self.id, value)
    }

    pub fn use_update_value(&self, value: D) -> Result<()> {
        self.store.use_update_value(self.id, value)
    }

    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe(&self, callback: impl Fn(&D) + 'static, label: Option<&str>) -> Result<Subscription> {
        self.store.subscribe(self.id, callback, label)
    }

    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe_deferred_reversed(
        &self,
        callback: impl Fn(&D) + 'static,
        label: Option<&str>,
    ) -> Result<Subscription> {
        self.store.subscribe_deferred_reversed(self.id, callback, label)
    }

    pub fn destroy(&self) {
        self.store.destroy(self.id);
    }

    pub fn restore(&self) -> bool {
        self.store.restore(self.id)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.store.is_destroyed(self.id)
    }
}
