#![forbid(unsafe_code)]

//! Reactive context plumbing: stores, selectors, and stacked values.
//!
//! # Architecture
//!
//! ```text
//! ProviderStore<D> ──owns──▶ per-id latest/temp value + SubscriptionRegistry<D>
//!        │                                   ▲
//!        │ ProviderHandle<D>                 │ subscribe_deferred_reversed
//!        ▼                                   │
//! StackComposer<V> ──publishes (Rc<V>,)──▶ SelectorHook<R, D> ──slot──▶ Mount
//! ```
//!
//! - [`SubscriptionRegistry`]: ordered callbacks with snapshot broadcast and
//!   reversed deferred registration.
//! - [`ProviderStore`]: provider ids, equality-gated publication, two-phase
//!   temp/commit, delayed destroy, and the default provider.
//! - [`SelectorHook`]: projected reads whose re-renders are gated by an
//!   equality function and coalesced through the [`Mount`].
//! - [`StackComposer`]: ordinal-ordered contributions folded over a root
//!   with suffix-only recomputation.
//!
//! All deferred work runs on the shared [`Scheduler`](relay_core::Scheduler).
//!
//! # Invariants
//!
//! 1. Everything here is single-threaded; handles are `Rc`-based and `!Send`.
//! 2. No internal borrow is held while user callbacks run, except where a
//!    module documents otherwise.
//! 3. Stores never share state; each owns its ids, values and registries.

pub mod deps;
pub mod mount;
pub mod registry;
pub mod selector;
pub mod stacked;
pub mod store;

pub use deps::{Deps, Memo};
pub use mount::{Mount, RenderCx};
pub use registry::{Subscription, SubscriptionRegistry};
pub use selector::SelectorHook;
pub use stacked::{Contribution, ContributionKey, Ordinal, StackComposer, StackStats, Stacked};
pub use store::{ProviderHandle, ProviderStore, StoreConfig};
