//! Trace trait and Visitor pattern for the node graph.
//!
//! Every value placed in a [`Heap`](crate::Heap) implements [`Trace`]. The
//! collector uses it to find a node's outgoing edges when marking, and the
//! heap uses it to keep edge counts balanced when a node is placed or
//! destroyed.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::BuildHasher;

use crate::error::fatal_error;
use crate::ptr::NodeId;

// ============================================================================
// Core Traits
// ============================================================================

/// A type whose values can live in the managed heap.
///
/// # Safety
///
/// `trace` **MUST** report every node this value refers to through a
/// [`GcEdge`](crate::GcEdge) (or other counted edge type), and must report
/// the same set each time it is called unless the edges were changed with
/// the heap-aware setters. A node that is referenced but not reported can be
/// reclaimed while still reachable; the stale reference then resolves to
/// nothing.
///
/// Prefer `#[derive(Trace)]` over a manual implementation.
///
/// # Examples
///
/// ```
/// use cellgc::{GcEdge, Trace, Visitor};
///
/// struct Pair {
///     car: GcEdge<Pair>,
///     cdr: GcEdge<Pair>,
/// }
///
/// unsafe impl Trace for Pair {
///     fn trace(&self, visitor: &mut dyn Visitor) {
///         self.car.trace(visitor);
///         self.cdr.trace(visitor);
///     }
///
///     fn detach(&self) {
///         self.car.detach();
///         self.cdr.detach();
///     }
/// }
/// ```
pub unsafe trait Trace {
    /// Report each outgoing edge to `visitor`.
    fn trace(&self, visitor: &mut dyn Visitor);

    /// Clear every outgoing edge.
    ///
    /// Called on unreachable nodes before any of them is dropped, so that
    /// destructors never observe edges into nodes that are being freed in
    /// the same sweep. Leaf types keep the default no-op.
    fn detach(&self) {}
}

/// Receives the edges reported by [`Trace::trace`].
///
/// Users generally do not implement this; the heap supplies visitors for
/// marking and for edge counting.
pub trait Visitor {
    /// Visit one referent.
    fn visit(&mut self, node: NodeId);
}

/// Visitor that records every referent in order.
#[derive(Debug, Default)]
pub(crate) struct Referents(pub Vec<NodeId>);

impl Visitor for Referents {
    fn visit(&mut self, node: NodeId) {
        self.0.push(node);
    }
}

/// The edges of `value`, in the order `trace` reports them.
pub(crate) fn referents_of(value: &dyn Trace) -> Vec<NodeId> {
    let mut referents = Referents::default();
    value.trace(&mut referents);
    referents.0
}

// ============================================================================
// Trace implementations for primitive types
// ============================================================================

macro_rules! impl_trace_for_leaves {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: leaf types contain no edges
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&self, _visitor: &mut dyn Visitor) {}
            }
        )*
    };
}

impl_trace_for_leaves! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char, (),
    String, &'static str,
    std::time::Duration,
    std::path::PathBuf,
    std::ffi::OsString,
}

macro_rules! impl_trace_for_leaf_cells {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: a cell of a leaf type contains no edges
            unsafe impl Trace for Cell<$t> {
                #[inline]
                fn trace(&self, _visitor: &mut dyn Visitor) {}
            }
        )*
    };
}

impl_trace_for_leaf_cells! {
    i8, i16, i32, i64, isize,
    u8, u16, u32, u64, usize,
    f32, f64, bool, char,
}

// SAFETY: PhantomData contains no data
unsafe impl<T: ?Sized> Trace for std::marker::PhantomData<T> {
    #[inline]
    fn trace(&self, _visitor: &mut dyn Visitor) {}
}

// ============================================================================
// Trace implementations for std container types
// ============================================================================

// SAFETY: Box traces its contents
unsafe impl<T: Trace + ?Sized> Trace for Box<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        T::trace(self.as_ref(), visitor);
    }

    fn detach(&self) {
        T::detach(self.as_ref());
    }
}

// SAFETY: Option traces its contents if Some
unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(inner) = self {
            inner.trace(visitor);
        }
    }

    fn detach(&self) {
        if let Some(inner) = self {
            inner.detach();
        }
    }
}

// SAFETY: Vec traces all elements
unsafe impl<T: Trace> Trace for Vec<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }

    fn detach(&self) {
        for item in self {
            item.detach();
        }
    }
}

// SAFETY: arrays trace all elements
unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }

    fn detach(&self) {
        for item in self {
            item.detach();
        }
    }
}

// SAFETY: VecDeque traces all elements
unsafe impl<T: Trace> Trace for VecDeque<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }

    fn detach(&self) {
        for item in self {
            item.detach();
        }
    }
}

// SAFETY: keys are assumed to hold no edges; values are traced
unsafe impl<K, V: Trace, S: BuildHasher> Trace for HashMap<K, V, S> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for value in self.values() {
            value.trace(visitor);
        }
    }

    fn detach(&self) {
        for value in self.values() {
            value.detach();
        }
    }
}

// SAFETY: as for HashMap
unsafe impl<K, V: Trace> Trace for BTreeMap<K, V> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        for value in self.values() {
            value.trace(visitor);
        }
    }

    fn detach(&self) {
        for value in self.values() {
            value.detach();
        }
    }
}

// SAFETY: RefCell traces its contents
//
// A RefCell that is mutably borrowed when the collector runs cannot be
// traced, and skipping it would let its referents be swept while reachable.
unsafe impl<T: Trace + ?Sized> Trace for RefCell<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        match self.try_borrow() {
            Ok(inner) => inner.trace(visitor),
            Err(_) => fatal_error("RefCell inside a node was mutably borrowed during tracing"),
        }
    }

    fn detach(&self) {
        if let Ok(inner) = self.try_borrow() {
            inner.detach();
        }
    }
}

// ============================================================================
// Trace implementations for tuples
// ============================================================================

macro_rules! impl_trace_for_tuples {
    () => {};
    ($first:ident $(, $rest:ident)*) => {
        // SAFETY: tuples trace all their elements
        unsafe impl<$first: Trace $(, $rest: Trace)*> Trace for ($first, $($rest,)*) {
            #[inline]
            #[allow(non_snake_case)]
            fn trace(&self, visitor: &mut dyn Visitor) {
                let ($first, $($rest,)*) = self;
                $first.trace(visitor);
                $($rest.trace(visitor);)*
            }

            #[allow(non_snake_case)]
            fn detach(&self) {
                let ($first, $($rest,)*) = self;
                $first.detach();
                $($rest.detach();)*
            }
        }
        impl_trace_for_tuples!($($rest),*);
    };
}

impl_trace_for_tuples!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<NodeId>);

    unsafe impl Trace for Fixed {
        fn trace(&self, visitor: &mut dyn Visitor) {
            for &id in &self.0 {
                visitor.visit(id);
            }
        }
    }

    #[test]
    fn test_leaves_report_nothing() {
        assert!(referents_of(&42_i32).is_empty());
        assert!(referents_of(&String::from("leaf")).is_empty());
        assert!(referents_of(&Cell::new(1.5_f64)).is_empty());
    }

    #[test]
    fn test_containers_report_in_order() {
        let a = NodeId::from_raw_parts(1, 0);
        let b = NodeId::from_raw_parts(2, 0);
        let c = NodeId::from_raw_parts(3, 7);
        let nested = (Fixed(vec![a]), vec![Fixed(vec![b, c])], Option::<Fixed>::None);
        assert_eq!(referents_of(&nested), vec![a, b, c]);
    }

    #[test]
    #[should_panic(expected = "mutably borrowed")]
    fn test_mutably_borrowed_refcell_is_fatal() {
        let cell = RefCell::new(Fixed(vec![]));
        let _guard = cell.borrow_mut();
        referents_of(&cell);
    }
}
