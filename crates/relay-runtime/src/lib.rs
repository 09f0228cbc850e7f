#![forbid(unsafe_code)]

//! Runtime: subscription registries, provider stores, selector hooks, and
//! ordered stack composition.

pub mod reactive;

pub use reactive::{
    Contribution, ContributionKey, Deps, Memo, Mount, Ordinal, ProviderHandle, ProviderStore,
    RenderCx, SelectorHook, StackComposer, StackStats, Stacked, StoreConfig, Subscription,
    SubscriptionRegistry,
};
