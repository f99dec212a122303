//! A memory core for language runtimes.
//!
//! `cellgc` manages a graph of nodes on behalf of an interpreter. Small
//! nodes live in fixed-size **cell pools**; reclamation combines **holder and
//! edge counting**, which frees most garbage the moment it becomes
//! unreferenced, with a **generational mark-sweep** collector that takes
//! care of cycles. **Weak references** with finalizers round it off.
//!
//! # Features
//!
//! - **Explicit heap**: all state lives in a [`Heap`] value; there are no
//!   globals and no thread-locals.
//! - **Scoped and indexed roots**: [`GcStackRoot`] for lexical scopes, the
//!   protect stack ([`Heap::protect`]) for everything else.
//! - **Non-moving**: node contents never move, so `&T` borrows through a
//!   [`NodeRef`] stay valid across collections.
//! - **Stale-safe handles**: a [`Gc<T>`] to a reclaimed node resolves to
//!   `None` instead of dangling.
//! - **`#[derive(Trace)]`** for node types.
//!
//! # Quick Start
//!
//! ```
//! use cellgc::{GcEdge, GcStackRoot, Heap, Trace};
//!
//! #[derive(Trace)]
//! struct Node {
//!     value: i32,
//!     next: GcEdge<Node>,
//! }
//!
//! let heap = Heap::new();
//! let tail = heap.alloc(Node { value: 2, next: GcEdge::empty() }).unwrap();
//! let head = heap.alloc(Node { value: 1, next: GcEdge::new(Some(tail)) }).unwrap();
//! let root = GcStackRoot::new(&heap, Some(head));
//!
//! heap.collect_full();
//! assert_eq!(root.borrow().unwrap().value, 1);
//! assert!(heap.contains(tail.id()));
//! ```
//!
//! # Handling Cycles
//!
//! ```
//! use cellgc::{GcEdge, GcStackRoot, Heap, Trace};
//!
//! #[derive(Trace)]
//! struct Node {
//!     next: GcEdge<Node>,
//! }
//!
//! let heap = Heap::new();
//! let a = heap.alloc(Node { next: GcEdge::empty() }).unwrap();
//! let root = GcStackRoot::new(&heap, Some(a));
//! let b = heap.alloc(Node { next: GcEdge::new(Some(a)) }).unwrap();
//! heap.get(a).unwrap().next.set(&heap, Some(b));
//!
//! // Create cycle: a -> b -> a, then drop the only root.
//! drop(root);
//! assert!(heap.contains(a.id()));
//! heap.collect_full(); // Cycle is detected and freed
//! assert!(!heap.contains(a.id()) && !heap.contains(b.id()));
//! ```
//!
//! # Thread Safety
//!
//! [`Heap`] is `!Send` and `!Sync`. Collections run on the allocating
//! thread, to completion, at allocation points and explicit requests only.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

// Lets `#[derive(Trace)]` name this crate from inside it.
extern crate self as cellgc;

pub mod cell_pool;
mod context;
mod edge;
mod error;
mod gc;
pub mod heap;
pub mod metrics;
mod node;
mod ptr;
mod roots;
mod trace;
mod tracing;
mod weak;

pub mod config;

// Re-export public API
pub use cell_pool::CellPool;
pub use config::HeapConfig;
pub use context::ContextId;
pub use edge::{EdgeList, GcEdge, RHandle};
pub use error::{AllocError, Condition, RootingError};
pub use gc::{GcHook, LEVEL_1_INTERVAL, LEVEL_2_INTERVAL};
pub use heap::Heap;
pub use metrics::{CollectionType, GcMetrics, HeapStats};
pub use node::NUM_GENERATIONS;
pub use ptr::{Gc, NodeId, NodeRef};
pub use roots::GcStackRoot;
pub use trace::{Trace, Visitor};
pub use weak::{FinalizerHost, Finalizer, NativeFinalizer, WeakRef, WeakRefState};

#[cfg(feature = "tracing")]
pub use crate::tracing::GcId;

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use cellgc_derive::Trace;
