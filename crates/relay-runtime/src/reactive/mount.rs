#![forbid(unsafe_code)]

//! Consumer mount: the per-component state a host keeps between renders.
//!
//! A [`Mount`] stands in for one mounted consumer. Hooks claim **slots** on
//! it in call order during a render pass; the same call order on the next
//! pass hands every hook its own state back. Hooks ask for another render
//! with [`Mount::request_rerender`], which is coalesced into one end-of-turn
//! invocation of the host's re-render callback.
//!
//! Unmounting runs registered cleanups (in reverse order) and drops every
//! slot, which in turn drops any [`Subscription`](super::Subscription) the
//! slots own.

use std::any::{Any, type_name};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use relay_core::{ContextError, MountId, Result, Scheduler};

use super::store::ProviderHandle;

struct MountInner {
    id: MountId,
    scheduler: Scheduler,
    rerender: Box<dyn Fn()>,
    slots: RefCell<Vec<Rc<dyn Any>>>,
    cursor: Cell<usize>,
    mounted: Cell<bool>,
    rerender_pending: Cell<bool>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    render_count: Cell<u64>,
}

/// Shared handle to one mounted consumer.
#[derive(Clone)]
pub struct Mount {
    inner: Rc<MountInner>,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.inner.id)
            .field("slots", &self.inner.slots.borrow().len())
            .field("mounted", &self.inner.mounted.get())
            .field("render_count", &self.inner.render_count.get())
            .finish()
    }
}

impl Mount {
    /// Create a mount whose re-render requests invoke `rerender`.
    pub fn new(scheduler: &Scheduler, rerender: impl Fn() + 'static) -> Self {
        Self {
            inner: Rc::new(MountInner {
                id: scheduler.allocate_mount_id(),
                scheduler: scheduler.clone(),
                rerender: Box::new(rerender),
                slots: RefCell::new(Vec::new()),
                cursor: Cell::new(0),
                mounted: Cell::new(true),
                rerender_pending: Cell::new(false),
                cleanups: RefCell::new(Vec::new()),
                render_count: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> MountId {
        self.inner.id
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Start a render pass: rewinds the slot cursor and satisfies any
    /// queued re-render request.
    pub fn begin_render(&self) {
        self.inner.cursor.set(0);
        self.inner.rerender_pending.set(false);
        self.inner
            .render_count
            .set(self.inner.render_count.get() + 1);
    }

    /// Claim the next slot, creating it with `init` on the first render.
    ///
    /// Fails with [`ContextError::HookOrder`] when the slot was created
    /// with a different type, i.e. hooks ran in a different order than on
    /// the previous pass.
    pub fn slot<T: 'static>(&self, init: impl FnOnce() -> T) -> Result<Rc<T>> {
        let index = self.inner.cursor.get();
        self.inner.cursor.set(index + 1);
        let existing = self.inner.slots.borrow().get(index).cloned();
        if let Some(existing) = existing {
            return existing.downcast::<T>().map_err(|_| ContextError::HookOrder {
                slot: index,
                expected: type_name::<T>(),
            });
        }
        let value = Rc::new(init());
        let mut slots = self.inner.slots.borrow_mut();
        if slots.len() != index {
            return Err(ContextError::HookOrder {
                slot: index,
                expected: type_name::<T>(),
            });
        }
        slots.push(Rc::clone(&value) as Rc<dyn Any>);
        Ok(value)
    }

    /// Ask the host for another render at the end of the turn. Repeated
    /// requests before that collapse into one.
    pub fn request_rerender(&self) {
        let inner = &self.inner;
        if !inner.mounted.get() || inner.rerender_pending.replace(true) {
            return;
        }
        let weak = Rc::downgrade(inner);
        inner.scheduler.schedule(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.mounted.get() && inner.rerender_pending.replace(false) {
                (inner.rerender)();
            }
        });
    }

    /// Whether a re-render is queued and not yet delivered.
    #[must_use]
    pub fn rerender_pending(&self) -> bool {
        self.inner.rerender_pending.get()
    }

    /// Register work to run on [`unmount`](Self::unmount).
    pub fn on_unmount(&self, cleanup: impl FnOnce() + 'static) {
        if self.inner.mounted.get() {
            self.inner.cleanups.borrow_mut().push(Box::new(cleanup));
        } else {
            cleanup();
        }
    }

    /// Tear the consumer down. Idempotent.
    pub fn unmount(&self) {
        if !self.inner.mounted.replace(false) {
            return;
        }
        self.inner.rerender_pending.set(false);
        let cleanups = std::mem::take(&mut *self.inner.cleanups.borrow_mut());
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
        let slots = std::mem::take(&mut *self.inner.slots.borrow_mut());
        let released = slots.len();
        drop(slots);
        tracing::debug!(message = "mount.unmount", mount = self.inner.id.0, slots = released);
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.get()
    }

    /// Render passes started so far.
    #[must_use]
    pub fn render_count(&self) -> u64 {
        self.inner.render_count.get()
    }

    pub(crate) fn downgrade(&self) -> WeakMount {
        WeakMount {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Non-owning mount reference held by subscription callbacks.
#[derive(Clone)]
pub(crate) struct WeakMount {
    inner: Weak<MountInner>,
}

impl WeakMount {
    pub(crate) fn upgrade(&self) -> Option<Mount> {
        self.inner.upgrade().map(|inner| Mount { inner })
    }
}

/// What a consumer renders against: its mount plus the provider in scope.
pub struct RenderCx<'a, R> {
    mount: &'a Mount,
    provider: &'a ProviderHandle<R>,
}

impl<R> Clone for RenderCx<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for RenderCx<'_, R> {}

impl<'a, R> RenderCx<'a, R> {
    #[must_use]
    pub fn new(mount: &'a Mount, provider: &'a ProviderHandle<R>) -> Self {
        Self { mount, provider }
    }

    #[must_use]
    pub fn mount(&self) -> &'a Mount {
        self.mount
    }

    #[must_use]
    pub fn provider(&self) -> &'a ProviderHandle<R> {
        self.provider
    }
}
