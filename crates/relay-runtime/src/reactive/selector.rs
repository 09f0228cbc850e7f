#![forbid(unsafe_code)]

//! Selector hooks: projected, equality-gated views of a provider's value.
//!
//! # Design
//!
//! A [`SelectorHook<R, D>`] is a projection `R -> D` from a provider tuple
//! plus a configurable default [`EqualityFn`]. It holds no per-consumer
//! state itself; each call during a render claims a slot on the consumer's
//! [`Mount`] that keeps:
//!
//! - the last returned value and the memo for its [`Deps`],
//! - the latest projection and equality (refreshed on every render),
//! - a deferred-reversed [`Subscription`] to the provider in scope,
//! - the most recent broadcast-time projection failure, if any.
//!
//! On broadcast the slot re-projects the new tuple and compares it with the
//! last returned value. Only a change stores the new value and asks the
//! mount for a re-render, which the mount coalesces into one end-of-turn
//! callback.
//!
//! [`extend_hook`](SelectorHook::extend_hook) composes a further projection
//! without any subscription of its own: the extended hook is just another
//! projection evaluated through the same per-call machinery. Its default
//! equality delegates to the parent's live setting.
//!
//! # Failure Modes
//!
//! - Projection failures during a broadcast are retained and re-raised on
//!   the next read as [`ContextError::ProjectionFailure`], carrying the
//!   hook label and the count of back-to-back failures.
//! - Projection failures during a read are returned immediately.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use relay_core::{
    ContextError, EqualityFn, EqualityInfo, ProjectionError, ProviderId, Result, SharedEquality,
};

use super::deps::{Deps, Memo};
use super::mount::{Mount, RenderCx, WeakMount};
use super::registry::Subscription;
use super::store::ProviderHandle;

type Project<R, T> = Rc<dyn Fn(&R) -> std::result::Result<T, ProjectionError>>;

/// A projected view over the provider tuple `R`.
///
/// Cloning yields the **same** hook: clones share the equality setting.
pub struct SelectorHook<R, D = R> {
    project: Rc<dyn Fn(&R) -> D>,
    equality: SharedEquality,
    label: Option<String>,
}

impl<R, D> Clone for SelectorHook<R, D> {
    fn clone(&self) -> Self {
        Self {
            project: Rc::clone(&self.project),
            equality: Rc::clone(&self.equality),
            label: self.label.clone(),
        }
    }
}

impl<R, D> fmt::Debug for SelectorHook<R, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorHook")
            .field("label", &self.label)
            .field("equality", &*self.equality.borrow())
            .finish()
    }
}

impl<R: Clone + 'static> SelectorHook<R, R> {
    /// Root hook: the identity view of the provider tuple.
    #[must_use]
    pub fn new() -> Self {
        Self {
            project: Rc::new(R::clone),
            equality: EqualityFn::builtin().shared(),
            label: None,
        }
    }
}

impl<R: Clone + 'static> Default for SelectorHook<R, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, D> SelectorHook<R, D>
where
    R: Clone + PartialEq + 'static,
    D: 'static,
{
    /// Attach a label used by subscriptions and failure reports.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Replace the default equality used by calls without their own.
    pub fn set_equality_fn(&self, equality: EqualityFn) {
        *self.equality.borrow_mut() = equality;
    }

    #[must_use]
    pub fn equality_fn_info(&self) -> EqualityInfo {
        self.equality.borrow().info()
    }

    /// Derive a hook over `further ∘ project`. The new hook's default
    /// equality follows this hook's setting, including later changes.
    pub fn extend_hook<E: 'static>(&self, further: impl Fn(&D) -> E + 'static) -> SelectorHook<R, E> {
        let base = Rc::clone(&self.project);
        SelectorHook {
            project: Rc::new(move |tuple: &R| further(&base(tuple))),
            equality: EqualityFn::inherit(&self.equality).shared(),
            label: self.label.clone(),
        }
    }

    /// Project a tuple without subscribing. Useful outside renders.
    pub fn project(&self, tuple: &R) -> D {
        (self.project)(tuple)
    }

    /// Shape 1: the hook's own view, re-read every render.
    pub fn get(&self, cx: RenderCx<'_, R>) -> Result<D>
    where
        D: Clone + PartialEq,
    {
        self.select(cx, D::clone, Deps::none())
    }

    /// Shape 2: project the hook's view with the default equality.
    pub fn select<T>(&self, cx: RenderCx<'_, R>, project: impl Fn(&D) -> T + 'static, deps: Deps) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
    {
        self.read(cx, move |view: &D| Ok(project(view)), None, deps)
    }

    /// Shape 3: project with a per-call equality that gates both re-renders
    /// and memoized recomputation.
    pub fn select_with<T>(
        &self,
        cx: RenderCx<'_, R>,
        project: impl Fn(&D) -> T + 'static,
        equality: EqualityFn,
        deps: Deps,
    ) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
    {
        self.read(cx, move |view: &D| Ok(project(view)), Some(equality), deps)
    }

    /// Shape 2 for projections that can fail.
    pub fn try_select<T>(
        &self,
        cx: RenderCx<'_, R>,
        project: impl Fn(&D) -> std::result::Result<T, ProjectionError> + 'static,
        deps: Deps,
    ) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
    {
        self.read(cx, project, None, deps)
    }

    /// Shape 3 for projections that can fail.
    pub fn try_select_with<T>(
        &self,
        cx: RenderCx<'_, R>,
        project: impl Fn(&D) -> std::result::Result<T, ProjectionError> + 'static,
        equality: EqualityFn,
        deps: Deps,
    ) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
    {
        self.read(cx, project, Some(equality), deps)
    }

    fn read<T>(
        &self,
        cx: RenderCx<'_, R>,
        project: impl Fn(&D) -> std::result::Result<T, ProjectionError> + 'static,
        equality: Option<EqualityFn>,
        deps: Deps,
    ) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
    {
        let mount = cx.mount();
        let provider = cx.provider();
        let selection: Rc<Selection<R, T>> = mount.slot(Selection::new)?;

        let base = Rc::clone(&self.project);
        let composed: Project<R, T> = Rc::new(move |tuple: &R| project(&base(tuple)));
        {
            let mut state = selection.state.borrow_mut();
            state.project = Some(composed);
            state.equality = equality.unwrap_or_else(|| EqualityFn::inherit(&self.equality));
            state.label.clone_from(&self.label);
        }
        selection.ensure_subscribed(mount, provider)?;

        if let Some(failure) = selection.take_failure() {
            return Err(failure);
        }

        selection.memo.try_get(deps, || selection.refresh(provider))?;
        selection
            .state
            .borrow()
            .value
            .clone()
            .ok_or(ContextError::UninitializedAccess {
                provider: provider.id(),
            })
    }
}

struct SelectionState<R, T> {
    project: Option<Project<R, T>>,
    equality: EqualityFn,
    label: Option<String>,
    value: Option<T>,
    failure: Option<ProjectionError>,
    consecutive_failures: u32,
}

/// Per-call hook state kept in a mount slot.
struct Selection<R, T> {
    state: Rc<RefCell<SelectionState<R, T>>>,
    memo: Memo<()>,
    subscribed_to: Cell<Option<ProviderId>>,
    subscription: RefCell<Option<Subscription>>,
}

impl<R, T> Selection<R, T>
where
    R: Clone + PartialEq + 'static,
    T: Clone + PartialEq + 'static,
{
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SelectionState {
                project: None,
                equality: EqualityFn::builtin(),
                label: None,
                value: None,
                failure: None,
                consecutive_failures: 0,
            })),
            memo: Memo::new(),
            subscribed_to: Cell::new(None),
            subscription: RefCell::new(None),
        }
    }

    /// Subscribe to `provider`, replacing a subscription to another one.
    fn ensure_subscribed(&self, mount: &Mount, provider: &ProviderHandle<R>) -> Result<()> {
        if self.subscribed_to.get() == Some(provider.id()) {
            return Ok(());
        }
        let label = self.state.borrow().label.clone();
        let callback = on_broadcast(Rc::downgrade(&self.state), mount.downgrade());
        let subscription = provider.subscribe_deferred_reversed(callback, label.as_deref())?;
        // The old subscription drops here.
        self.subscription.replace(Some(subscription));
        self.subscribed_to.set(Some(provider.id()));
        self.memo.invalidate();
        Ok(())
    }

    fn take_failure(&self) -> Option<ContextError> {
        let mut state = self.state.borrow_mut();
        let source = state.failure.take()?;
        Some(ContextError::ProjectionFailure {
            label: state.label.clone(),
            consecutive: state.consecutive_failures,
            source,
        })
    }

    /// Re-project the latest tuple, keeping the previous value when equal.
    fn refresh(&self, provider: &ProviderHandle<R>) -> Result<()> {
        let tuple = provider.latest_value()?;
        let Some(project) = self.state.borrow().project.clone() else {
            return Ok(());
        };
        match project(&tuple) {
            Ok(next) => {
                let mut state = self.state.borrow_mut();
                state.consecutive_failures = 0;
                let unchanged = state
                    .value
                    .as_ref()
                    .is_some_and(|prev| state.equality.compare(prev, &next));
                if !unchanged {
                    state.value = Some(next);
                }
                Ok(())
            }
            Err(source) => {
                let mut state = self.state.borrow_mut();
                state.consecutive_failures += 1;
                Err(ContextError::ProjectionFailure {
                    label: state.label.clone(),
                    consecutive: state.consecutive_failures,
                    source,
                })
            }
        }
    }
}

fn on_broadcast<R, T>(state: Weak<RefCell<SelectionState<R, T>>>, mount: WeakMount) -> impl Fn(&R) + 'static
where
    R: 'static,
    T: PartialEq + 'static,
{
    move |tuple: &R| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let Some(project) = state.borrow().project.clone() else {
            return;
        };
        let outcome = project(tuple);
        let changed = {
            let mut state = state.borrow_mut();
            match outcome {
                Ok(next) => {
                    state.consecutive_failures = 0;
                    let unchanged = state
                        .value
                        .as_ref()
                        .is_some_and(|prev| state.equality.compare(prev, &next));
                    if !unchanged {
                        state.value = Some(next);
                    }
                    !unchanged
                }
                Err(source) => {
                    state.consecutive_failures += 1;
                    tracing::warn!(
                        message = "selector.projection_failed",
                        label = ?state.label,
                        consecutive = state.consecutive_failures,
                        error = %source
                    );
                    state.failure = Some(source);
                    true
                }
            }
        };
        if changed {
            if let Some(mount) = mount.upgrade() {
                mount.request_rerender();
            }
        }
    }
}
