#![forbid(unsafe_code)]

//! Relay public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub use relay_core::{ContextError, EqualityFn, ProjectionError, Result, Scheduler};

pub mod prelude {
    pub use relay_core as core;
    pub use relay_core::{
        ContextError, EqualityFn, EqualityInfo, ProjectionError, ProviderId, Scheduler,
        SchedulerConfig,
    };

    #[cfg(feature = "runtime")]
    pub use relay_runtime as runtime;
    #[cfg(feature = "runtime")]
    pub use relay_runtime::{
        Contribution, Deps, Mount, ProviderHandle, ProviderStore, RenderCx, SelectorHook,
        StackComposer, Stacked, StoreConfig, Subscription,
    };
}
