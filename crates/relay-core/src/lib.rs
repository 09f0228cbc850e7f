#![forbid(unsafe_code)]

//! Core: identifiers, error taxonomy, equality functions, and the turn scheduler.

pub mod equality;
pub mod error;
pub mod id;
pub mod scheduler;

pub use equality::{EqualityFn, EqualityInfo, SharedEquality};
pub use error::{ContextError, ProjectionError, Result};
pub use id::{MountId, ProviderId, SubscriptionToken, TaskId};
pub use scheduler::{Scheduler, SchedulerConfig};
