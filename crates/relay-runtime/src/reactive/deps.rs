#![forbid(unsafe_code)]

//! Explicit invalidation lists for selector reads.
//!
//! [`Deps`] mirrors a memoization dependency list:
//!
//! | Constructor       | Recompute on read                  |
//! |-------------------|------------------------------------|
//! | [`Deps::none`]    | every time                         |
//! | [`Deps::empty`]   | never (first read only)            |
//! | [`Deps::of`]      | when the key compares unequal      |
//!
//! Keys are type-erased; a key of a different type than the previous one
//! counts as changed.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

trait DepKey {
    fn as_any(&self) -> &dyn Any;
    fn same_as(&self, other: &dyn DepKey) -> bool;
}

impl<K: PartialEq + 'static> DepKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_as(&self, other: &dyn DepKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }
}

#[derive(Clone, Default)]
enum Kind {
    #[default]
    Unlisted,
    Empty,
    Keyed(Rc<dyn DepKey>),
}

/// Dependency list attached to a selector read.
#[derive(Clone, Default)]
pub struct Deps {
    kind: Kind,
}

impl Deps {
    /// No list: recompute on every read.
    #[must_use]
    pub fn none() -> Self {
        Self { kind: Kind::Unlisted }
    }

    /// An empty list: compute once, then only broadcasts refresh the value.
    #[must_use]
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// Recompute whenever `key` differs from the previous read's key.
    /// Use a tuple for several keys.
    pub fn of<K: PartialEq + 'static>(key: K) -> Self {
        Self {
            kind: Kind::Keyed(Rc::new(key)),
        }
    }

    /// Whether a read with `self` may reuse the result computed under
    /// `previous`.
    #[must_use]
    pub fn unchanged_since(&self, previous: &Deps) -> bool {
        match (&self.kind, &previous.kind) {
            (Kind::Empty, Kind::Empty) => true,
            (Kind::Keyed(next), Kind::Keyed(prev)) => next.same_as(prev.as_ref()),
            _ => false,
        }
    }
}

impl fmt::Debug for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Unlisted => f.write_str("Deps::none"),
            Kind::Empty => f.write_str("Deps::empty"),
            Kind::Keyed(_) => f.write_str("Deps::of(..)"),
        }
    }
}

/// Result cache keyed by a [`Deps`] list.
///
/// The first call always computes. Later calls recompute only when the
/// supplied deps changed; a failed computation leaves the previous result
/// and deps in place.
pub struct Memo<T> {
    state: RefCell<Option<(T, Deps)>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            state: RefCell::new(None),
        }
    }
}

impl<T: Clone> Memo<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, deps: Deps, compute: impl FnOnce() -> T) -> T {
        match self.try_get(deps, || Ok::<T, std::convert::Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    pub fn try_get<E>(&self, deps: Deps, compute: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        if let Some((value, previous)) = self.state.borrow().as_ref() {
            if deps.unchanged_since(previous) {
                return Ok(value.clone());
            }
        }
        let value = compute()?;
        *self.state.borrow_mut() = Some((value.clone(), deps));
        Ok(value)
    }

    /// Forget the cached result; the next call computes.
    pub fn invalidate(&self) {
        self.state.borrow_mut().take();
    }

    #[must_use]
    pub fn is_computed(&self) -> bool {
        self.state.borrow().is_some()
    }
}

impl<T> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Memo")
            .field("computed", &state.is_some())
            .field("deps", &state.as_ref().map(|(_, deps)| deps))
            .finish()
    }
}
