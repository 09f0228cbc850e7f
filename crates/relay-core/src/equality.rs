#![forbid(unsafe_code)]

//! Equality functions used to gate notifications.
//!
//! Store-level and per-call comparisons are ordinary typed closures. The
//! hook-level default, however, is shared between a selector hook and every
//! hook extended from it, and those hooks select values of different types.
//! [`EqualityFn`] is therefore type-erased:
//!
//! - [`EqualityFn::builtin`] compares with `PartialEq`. For provider tuples
//!   this is slot-wise comparison; tuples of different arity never type-check
//!   against each other.
//! - [`EqualityFn::custom`] wraps a typed closure. Applied to values of any
//!   other type it reports "changed", so a mismatched function can cause an
//!   extra re-render but never swallows an update.
//! - [`EqualityFn::inherit`] delegates to another hook's live setting, so a
//!   later `set_equality_fn` on the parent reaches every extended child.
//!
//! [`EqualityFn::is_default`] resolves through inheritance; extended hooks use
//! it to decide whether to fall back to the built-in comparison.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type ErasedEq = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// A hook's configurable default equality, shared with extended hooks.
pub type SharedEquality = Rc<RefCell<EqualityFn>>;

#[derive(Clone, Default)]
pub struct EqualityFn {
    kind: Kind,
}

#[derive(Clone, Default)]
enum Kind {
    #[default]
    Builtin,
    Custom(ErasedEq),
    Inherited(SharedEquality),
}

/// Answer to "which equality is configured, and is it the built-in one".
#[derive(Clone, Debug)]
pub struct EqualityInfo {
    pub function: EqualityFn,
    pub is_default: bool,
}

impl EqualityFn {
    /// The built-in `PartialEq` comparison.
    #[must_use]
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Wrap a typed comparison.
    pub fn custom<T: 'static>(eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        let erased: ErasedEq = Rc::new(move |prev: &dyn Any, next: &dyn Any| {
            match (prev.downcast_ref::<T>(), next.downcast_ref::<T>()) {
                (Some(prev), Some(next)) => eq(prev, next),
                _ => false,
            }
        });
        Self {
            kind: Kind::Custom(erased),
        }
    }

    /// Delegate to whatever `parent` holds at comparison time.
    #[must_use]
    pub fn inherit(parent: &SharedEquality) -> Self {
        Self {
            kind: Kind::Inherited(Rc::clone(parent)),
        }
    }

    /// Whether this resolves to the built-in comparison.
    #[must_use]
    pub fn is_default(&self) -> bool {
        match &self.kind {
            Kind::Builtin => true,
            Kind::Custom(_) => false,
            Kind::Inherited(parent) => parent.borrow().is_default(),
        }
    }

    #[must_use]
    pub fn info(&self) -> EqualityInfo {
        EqualityInfo {
            function: self.clone(),
            is_default: self.is_default(),
        }
    }

    /// Compare two values; `true` means "unchanged".
    pub fn compare<T: PartialEq + 'static>(&self, prev: &T, next: &T) -> bool {
        match &self.kind {
            Kind::Builtin => prev == next,
            Kind::Custom(eq) => eq(prev, next),
            Kind::Inherited(parent) => {
                // Release the borrow before running user code.
                let resolved = parent.borrow().clone();
                resolved.compare(prev, next)
            }
        }
    }

    /// Whether both handles refer to the same underlying function object.
    #[must_use]
    pub fn same_function(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (Kind::Builtin, Kind::Builtin) => true,
            (Kind::Custom(a), Kind::Custom(b)) => Rc::ptr_eq(a, b),
            (Kind::Inherited(a), Kind::Inherited(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Wrap in a fresh shared cell.
    #[must_use]
    pub fn shared(self) -> SharedEquality {
        Rc::new(RefCell::new(self))
    }
}

impl fmt::Debug for EqualityFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Builtin => f.write_str("EqualityFn::Builtin"),
            Kind::Custom(_) => f.write_str("EqualityFn::Custom"),
            Kind::Inherited(_) => f
                .debug_struct("EqualityFn::Inherited")
                .field("is_default", &self.is_default())
                .finish(),
        }
    }
}
