#![forbid(unsafe_code)]

//! Error taxonomy shared by the store, the selector hooks, and the mount.
//!
//! Store-level and registry-level faults are returned to the immediate
//! caller. Projection failures raised while a broadcast is in flight are
//! held by the failing selector and surfaced on its next synchronous read,
//! so one buggy projection never interrupts its sibling subscribers.

use thiserror::Error;

use crate::id::ProviderId;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    /// The provider has neither a pending nor a committed value.
    #[error("provider {provider} is not initialized yet")]
    UninitializedAccess { provider: ProviderId },

    /// The default provider was read but no default value is available.
    #[error("no provider is mounted and no default value is configured")]
    MissingDefaultValue,

    /// A selector projection failed while handling a broadcast.
    #[error(
        "selector{} projection failed: {source}{}",
        label_suffix(.label),
        correlation_note(.consecutive)
    )]
    ProjectionFailure {
        label: Option<String>,
        consecutive: u32,
        #[source]
        source: ProjectionError,
    },

    /// The provider's storage was purged by a completed destroy.
    #[error("provider {provider} has been destroyed")]
    ProviderDestroyed { provider: ProviderId },

    /// Hook state was read back with a different type than it was created with.
    #[error("hook slot {slot} holds a different hook than `{expected}`")]
    HookOrder { slot: usize, expected: &'static str },
}

impl ContextError {
    /// Whether the error points at a wiring mistake rather than a data fault.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UninitializedAccess { .. } | Self::MissingDefaultValue | Self::HookOrder { .. }
        )
    }
}

fn label_suffix(label: &Option<String>) -> String {
    match label {
        Some(label) => format!(" `{label}`"),
        None => String::new(),
    }
}

fn correlation_note(consecutive: &u32) -> String {
    if *consecutive > 1 {
        format!(" ({consecutive} consecutive failures)")
    } else {
        String::new()
    }
}

/// Failure reported by a fallible selector projection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProjectionError {
    message: String,
}

impl ProjectionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ProjectionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProjectionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
