#![forbid(unsafe_code)]

//! Ordered stack composition.
//!
//! A [`StackComposer<V>`] folds an ordered sequence of contributions over a
//! root value and publishes the result through a provider as a
//! [`Stacked<V>`] tuple. Each contribution is either an override (its input
//! *is* the value at that position) or a transform of the previous
//! position's value.
//!
//! # Ordering
//!
//! Positions sort by `(ordinal, insertion sequence)`. The root sits at
//! [`Ordinal::Root`], below every explicit ordinal, so negative ordinals
//! land between the root and the automatic ordinals (which count up from
//! 0). Moving a contribution with [`Contribution::set_order`] counts as a
//! fresh insertion: it goes after existing contributions of equal ordinal.
//!
//! # Caching
//!
//! Every position caches its value as an `Rc<V>`. A mutation records the
//! lowest affected index; the next recompute seeds from the cached value
//! just before it and walks forward, so positions before the change keep
//! their exact `Rc`. With nothing dirty a recompute does no work.
//!
//! # Invariants
//!
//! 1. Contributions are always sorted by `(ordinal, seq)`.
//! 2. Positions before the dirty index hold a cached value.
//! 3. Mutations between publications coalesce into one end-of-turn publish.
//! 4. Transforms must not call back into their own composer.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use relay_core::{Result, Scheduler, TaskId};

use super::store::ProviderHandle;

/// Tuple type a composer publishes.
pub type Stacked<V> = (Rc<V>,);

/// Position of a contribution. `Root` orders before every `At`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ordinal {
    Root,
    At(i64),
}

/// Identity of one contribution within its composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContributionKey(u64);

impl ContributionKey {
    /// Key of the root contribution.
    pub const ROOT: Self = Self(0);
}

impl fmt::Display for ContributionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ROOT {
            f.write_str("root")
        } else {
            write!(f, "contribution#{}", self.0)
        }
    }
}

/// Recompute counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    /// Recomputes that had something dirty.
    pub recomputes: u64,
    /// Contribution values produced across all recomputes.
    pub steps_evaluated: u64,
}

enum Step<V> {
    Override(Rc<V>),
    Transform(Rc<dyn Fn(&V) -> V>),
}

impl<V> Step<V> {
    fn apply(&self, prev: &Rc<V>) -> Rc<V> {
        match self {
            Self::Override(value) => Rc::clone(value),
            Self::Transform(f) => Rc::new(f(prev)),
        }
    }
}

struct Entry<V> {
    key: ContributionKey,
    ordinal: i64,
    seq: u64,
    step: Step<V>,
    cached: Option<Rc<V>>,
}

struct ComposerInner<V> {
    root: Rc<V>,
    entries: Vec<Entry<V>>,
    next_key: u64,
    next_seq: u64,
    next_auto: i64,
    /// Lowest entry index whose cached value is stale.
    dirty_from: Option<usize>,
    publish_task: Option<TaskId>,
    stats: StackStats,
}

impl<V> ComposerInner<V> {
    fn position(&self, key: ContributionKey) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    fn mark_dirty(&mut self, index: usize) {
        self.dirty_from = Some(self.dirty_from.map_or(index, |d| d.min(index)));
    }

    fn insert(&mut self, key: ContributionKey, ordinal: i64, step: Step<V>) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        let index = self
            .entries
            .partition_point(|e| (e.ordinal, e.seq) < (ordinal, seq));
        self.entries.insert(
            index,
            Entry {
                key,
                ordinal,
                seq,
                step,
                cached: None,
            },
        );
        self.mark_dirty(index);
        index
    }

    fn result(&self) -> Rc<V> {
        self.entries
            .last()
            .and_then(|e| e.cached.clone())
            .unwrap_or_else(|| Rc::clone(&self.root))
    }

    fn recompute(&mut self) -> Rc<V> {
        let Some(mut start) = self.dirty_from.take() else {
            return self.result();
        };
        let mut acc = match start.checked_sub(1).map(|i| self.entries[i].cached.clone()) {
            Some(Some(seed)) => seed,
            Some(None) => {
                start = 0;
                Rc::clone(&self.root)
            }
            None => Rc::clone(&self.root),
        };
        let mut steps = 0;
        for entry in &mut self.entries[start..] {
            let value = entry.step.apply(&acc);
            entry.cached = Some(Rc::clone(&value));
            acc = value;
            steps += 1;
        }
        self.stats.recomputes += 1;
        self.stats.steps_evaluated += steps;
        tracing::trace!(message = "stack.recompute", from = start, steps);
        self.result()
    }
}

/// Composer of one stacked value.
///
/// Cloning yields another handle to the same composer.
pub struct StackComposer<V> {
    inner: Rc<RefCell<ComposerInner<V>>>,
    provider: ProviderHandle<Stacked<V>>,
}

impl<V> Clone for StackComposer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            provider: self.provider.clone(),
        }
    }
}

impl<V> fmt::Debug for StackComposer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("StackComposer")
            .field("provider", &self.provider.id())
            .field("contributions", &inner.entries.len())
            .field("dirty_from", &inner.dirty_from)
            .field("stats", &inner.stats)
            .finish()
    }
}

impl<V: PartialEq + 'static> StackComposer<V> {
    /// Create a composer over `root` and publish it right away.
    pub fn new(provider: ProviderHandle<Stacked<V>>, root: V) -> Result<Self> {
        let composer = Self {
            inner: Rc::new(RefCell::new(ComposerInner {
                root: Rc::new(root),
                entries: Vec::new(),
                next_key: 1,
                next_seq: 0,
                next_auto: 0,
                dirty_from: None,
                publish_task: None,
                stats: StackStats::default(),
            })),
            provider,
        };
        composer.publish()?;
        Ok(composer)
    }

    #[must_use]
    pub fn provider(&self) -> &ProviderHandle<Stacked<V>> {
        &self.provider
    }

    fn scheduler(&self) -> &Scheduler {
        self.provider.store().scheduler()
    }

    /// Override at the next automatic ordinal.
    pub fn push(&self, input: V) -> Contribution<V, V> {
        let ordinal = self.next_auto();
        self.insert_at(ordinal, input)
    }

    /// Transform at the next automatic ordinal. `f` receives this
    /// contribution's input and the previous position's value.
    pub fn push_transform<I: 'static>(
        &self,
        input: I,
        f: impl Fn(&I, &V) -> V + 'static,
    ) -> Contribution<I, V> {
        let ordinal = self.next_auto();
        self.insert_transform_at(ordinal, input, f)
    }

    /// Override at an explicit ordinal.
    pub fn insert_at(&self, ordinal: i64, input: V) -> Contribution<V, V> {
        self.add(ordinal, input, Rc::new(|input: V| Step::Override(Rc::new(input))))
    }

    /// Transform at an explicit ordinal.
    pub fn insert_transform_at<I: 'static>(
        &self,
        ordinal: i64,
        input: I,
        f: impl Fn(&I, &V) -> V + 'static,
    ) -> Contribution<I, V> {
        let f = Rc::new(f);
        let make_step: MakeStep<I, V> = Rc::new(move |input: I| {
            let f = Rc::clone(&f);
            Step::Transform(Rc::new(move |prev: &V| f(&input, prev)))
        });
        self.add(ordinal, input, make_step)
    }

    fn next_auto(&self) -> i64 {
        let mut inner = self.inner.borrow_mut();
        let ordinal = inner.next_auto;
        inner.next_auto += 1;
        ordinal
    }

    fn add<I>(&self, ordinal: i64, input: I, make_step: MakeStep<I, V>) -> Contribution<I, V> {
        let key = {
            let mut inner = self.inner.borrow_mut();
            let key = ContributionKey(inner.next_key);
            inner.next_key += 1;
            inner.insert(key, ordinal, make_step(input));
            key
        };
        self.schedule_publish();
        Contribution {
            key,
            composer: Rc::downgrade(&self.inner),
            provider: self.provider.clone(),
            make_step,
        }
    }

    /// Replace the root value; every position recomputes.
    pub fn set_root(&self, root: V) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.root = Rc::new(root);
            inner.mark_dirty(0);
        }
        self.schedule_publish();
    }

    /// The composed value, recomputing the dirty suffix if needed.
    pub fn value(&self) -> Rc<V> {
        self.inner.borrow_mut().recompute()
    }

    /// Recompute and publish now, superseding a queued publish.
    pub fn publish(&self) -> Result<Rc<V>> {
        let (value, task) = {
            let mut inner = self.inner.borrow_mut();
            (inner.recompute(), inner.publish_task.take())
        };
        if let Some(task) = task {
            self.scheduler().cancel(task);
        }
        self.provider.update_value((Rc::clone(&value),))?;
        Ok(value)
    }

    fn schedule_publish(&self) {
        schedule_publish(&self.inner, &self.provider);
    }

    /// Cached value at `key`, if computed. The root is always available.
    #[must_use]
    pub fn cached_value(&self, key: ContributionKey) -> Option<Rc<V>> {
        let inner = self.inner.borrow();
        if key == ContributionKey::ROOT {
            return Some(Rc::clone(&inner.root));
        }
        inner
            .entries
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.cached.clone())
    }

    /// Positions in composition order, root first.
    #[must_use]
    pub fn ordinals(&self) -> Vec<(ContributionKey, Ordinal)> {
        let inner = self.inner.borrow();
        std::iter::once((ContributionKey::ROOT, Ordinal::Root))
            .chain(inner.entries.iter().map(|e| (e.key, Ordinal::At(e.ordinal))))
            .collect()
    }

    /// Contributions excluding the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> StackStats {
        self.inner.borrow().stats
    }
}

fn schedule_publish<V: PartialEq + 'static>(
    inner: &Rc<RefCell<ComposerInner<V>>>,
    provider: &ProviderHandle<Stacked<V>>,
) {
    if inner.borrow().publish_task.is_some() {
        return;
    }
    let weak = Rc::downgrade(inner);
    let target = provider.clone();
    let task = provider.store().scheduler().schedule(move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.borrow_mut().publish_task = None;
        let composer = StackComposer {
            inner,
            provider: target,
        };
        if let Err(err) = composer.publish() {
            tracing::warn!(message = "stack.publish_failed", error = %err);
        }
    });
    inner.borrow_mut().publish_task = Some(task);
}

type MakeStep<I, V> = Rc<dyn Fn(I) -> Step<V>>;

/// Handle to one contribution, typed by its input.
pub struct Contribution<I, V> {
    key: ContributionKey,
    composer: Weak<RefCell<ComposerInner<V>>>,
    provider: ProviderHandle<Stacked<V>>,
    make_step: MakeStep<I, V>,
}

impl<I, V> fmt::Debug for Contribution<I, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contribution").field("key", &self.key).finish()
    }
}

impl<I, V: PartialEq + 'static> Contribution<I, V> {
    #[must_use]
    pub fn key(&self) -> ContributionKey {
        self.key
    }

    /// Current ordinal, or `None` once removed.
    #[must_use]
    pub fn ordinal(&self) -> Option<Ordinal> {
        let inner = self.composer.upgrade()?;
        let inner = inner.borrow();
        let index = inner.position(self.key)?;
        Some(Ordinal::At(inner.entries[index].ordinal))
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.ordinal().is_some()
    }

    /// Replace the input. Returns `false` if the contribution is gone.
    pub fn set_input(&self, input: I) -> bool {
        self.mutate(|inner| {
            let index = inner.position(self.key)?;
            inner.entries[index].step = (self.make_step)(input);
            inner.entries[index].cached = None;
            inner.mark_dirty(index);
            Some(())
        })
    }

    /// Move to `ordinal`, after existing contributions of equal ordinal.
    pub fn set_order(&self, ordinal: i64) -> bool {
        self.mutate(|inner| {
            let from = inner.position(self.key)?;
            let entry = inner.entries.remove(from);
            inner.mark_dirty(from);
            inner.insert(self.key, ordinal, entry.step);
            Some(())
        })
    }

    /// Take this contribution out of the stack.
    pub fn remove(self) -> bool {
        self.mutate(|inner| {
            let index = inner.position(self.key)?;
            inner.entries.remove(index);
            inner.mark_dirty(index);
            Some(())
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut ComposerInner<V>) -> Option<()>) -> bool {
        let Some(inner) = self.composer.upgrade() else {
            return false;
        };
        let applied = f(&mut inner.borrow_mut()).is_some();
        if applied {
            schedule_publish(&inner, &self.provider);
        }
        applied
    }
}
