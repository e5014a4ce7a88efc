//! Cell arena and generational garbage collector.
//!
//! # Architecture
//!
//! Every runtime object — combinator, partial application, unevaluated
//! application node, continuation frame — is one fixed-layout [`Cell`].
//! Cells live in one of two generations:
//!
//! - **Nursery**: a buffer split into two equal halves. Allocation bumps a
//!   pointer in the active half; when it runs out, live cells are copied to
//!   the other half (Cheney's algorithm) and the halves swap. Each copy
//!   increments the cell's age; a cell that reaches `AGE_MAX` at copy time
//!   is promoted instead.
//! - **Old generation**: a list of fixed-size chunks. Free cells form a
//!   freelist threaded through their `l` field; allocation pops one cell.
//!   When promotion finds the freelist empty, a mark–sweep collection runs
//!   over all chunks, and the heap grows until at least a fifth of the old
//!   generation is free again.
//!
//! Cells are write-once after construction (the two exceptions: retagging to
//! [`Tag::Copied`] during a minor collection, and the parser filling the
//! children of a pending application node). Children of an old cell were
//! either already old when the cell was built or sat in the nursery and will
//! be promoted together, so no old-to-nursery reference survives a
//! safepoint and the collector needs no write barrier.

pub mod heap;
pub mod types;

pub use heap::{GcError, GcStats, Heap, HeapConfig};
pub use types::{Cell, CellRef, Constants, Tag, AGE_MAX};
