//! The generational heap: bump-allocated nursery with Cheney copying,
//! chunked mark–sweep old generation.
//!
//! Nursery handles are invalidated by a minor collection; callers hand
//! their live handles to [`Heap::collect_minor`] as a root slice and read
//! the moved handles back out of it, the way the evaluator does at its
//! safepoints. Old-generation handles never move.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

use super::types::{Cell, CellRef, Constants, Tag, AGE_MAX, OLD_AGE};

/// Smallest usable nursery half / old chunk, in cells.
const MIN_SIZE: usize = 32;

/// Heap sizing knobs. All figures are cell counts.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Capacity of each nursery half.
    pub young_size: usize,
    /// Cells per old-generation chunk.
    pub chunk_size: usize,
    /// Hard cap on the old generation; growing past it is an
    /// out-of-memory error.
    pub max_old_cells: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            young_size: 64 * 1024,
            chunk_size: 64 * 1024,
            max_old_cells: usize::MAX,
        }
    }
}

/// Collector counters, kept since heap creation.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub minor_collections: usize,
    pub major_collections: usize,
    /// Cells that survived a minor collection into the other nursery half.
    pub cells_copied: usize,
    /// Cells promoted into the old generation.
    pub cells_promoted: usize,
    /// Old-generation cells live after the most recent major collection.
    pub old_cells_live: usize,
    pub heap_chunks: usize,
    /// Wall time spent inside the collector.
    pub gc_time: Duration,
}

#[derive(Clone, Debug)]
pub enum GcError {
    /// The old generation would have to grow past its configured limit.
    OutOfMemory { capacity: usize, limit: usize },
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory { capacity, limit } => write!(
                f,
                "out of memory: old generation at {} cells, limit {}",
                capacity, limit
            ),
        }
    }
}

impl std::error::Error for GcError {}

/// Raised inside a minor collection when promotion finds the freelist
/// empty; the caller runs a major collection and retries.
struct NeedMajor;

/// The two-generation cell heap.
pub struct Heap {
    /// Both nursery halves, back to back.
    young: Vec<Cell>,
    /// Capacity of one half.
    young_size: usize,
    /// Base index of the active half.
    from_base: usize,
    /// Next free nursery slot (absolute index into `young`).
    young_next: usize,
    /// Old-generation chunks. Boxed so cells never move once a chunk is in.
    chunks: Vec<Box<[Cell]>>,
    chunk_size: usize,
    /// Head of the freelist threaded through the `l` field of free cells.
    free_head: CellRef,
    free_count: usize,
    /// Total old-generation cells across all chunks.
    old_capacity: usize,
    max_old_cells: usize,
    consts: Constants,
    pub stats: GcStats,
}

impl Heap {
    /// Build a heap: both nursery halves, the first old chunk, and the nine
    /// shared nullary combinators carved out of it.
    pub fn new(config: HeapConfig) -> Heap {
        let young_size = config.young_size.max(MIN_SIZE);
        let chunk_size = config
            .chunk_size
            .clamp(MIN_SIZE, config.max_old_cells.max(MIN_SIZE));
        let mut heap = Heap {
            young: vec![Cell::nullary(Tag::Free); 2 * young_size],
            young_size,
            from_base: 0,
            young_next: 0,
            chunks: Vec::new(),
            chunk_size,
            free_head: CellRef::NIL,
            free_count: 0,
            old_capacity: 0,
            max_old_cells: config.max_old_cells.max(chunk_size),
            consts: Constants {
                i: CellRef::NIL,
                k: CellRef::NIL,
                s: CellRef::NIL,
                v: CellRef::NIL,
                d: CellRef::NIL,
                c: CellRef::NIL,
                e: CellRef::NIL,
                at: CellRef::NIL,
                pipe: CellRef::NIL,
            },
            stats: GcStats::default(),
        };
        // The clamp above guarantees the first chunk fits.
        let first = heap.add_chunk();
        assert!(first.is_ok(), "first chunk must fit under the clamped limit");
        heap.consts = Constants {
            i: heap.alloc_const(Tag::I),
            k: heap.alloc_const(Tag::K),
            s: heap.alloc_const(Tag::S),
            v: heap.alloc_const(Tag::V),
            d: heap.alloc_const(Tag::D),
            c: heap.alloc_const(Tag::C),
            e: heap.alloc_const(Tag::E),
            at: heap.alloc_const(Tag::At),
            pipe: heap.alloc_const(Tag::Pipe),
        };
        heap
    }

    /// A heap with the default sizing.
    pub fn default_heap() -> Heap {
        Heap::new(HeapConfig::default())
    }

    /// The shared nullary combinator cells. Permanent roots; the handles
    /// stay valid for the heap's whole lifetime.
    pub fn constants(&self) -> Constants {
        self.consts
    }

    pub fn is_old(&self, r: CellRef) -> bool {
        self[r].age > AGE_MAX
    }

    /// Nursery cells allocated in the active half.
    pub fn young_used(&self) -> usize {
        self.young_next - self.from_base
    }

    pub fn free_cells(&self) -> usize {
        self.free_count
    }

    pub fn old_capacity(&self) -> usize {
        self.old_capacity
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// True when the active nursery half has room for `n` more cells.
    pub fn young_has(&self, n: usize) -> bool {
        self.young_next + n <= self.from_base + self.young_size
    }

    /// Bump-allocate in the nursery. Callers must have checked headroom at
    /// a safepoint; running out here means a safepoint was missed.
    pub fn alloc_young(&mut self, cell: Cell) -> CellRef {
        assert!(
            self.young_has(1),
            "nursery overflow: allocation outside a safepoint"
        );
        let r = CellRef::new(self.young_next);
        self.young_next += 1;
        self.young[r.index()] = Cell {
            age: 0,
            mark: false,
            ..cell
        };
        r
    }

    /// Allocate directly in the old generation (parser path), growing the
    /// heap when the freelist is empty.
    pub fn alloc_old(&mut self, cell: Cell) -> Result<CellRef, GcError> {
        let mut r = self.pop_free();
        if r.is_nil() {
            self.add_chunk()?;
            r = self.pop_free();
        }
        self[r] = Cell {
            age: OLD_AGE,
            mark: false,
            ..cell
        };
        Ok(r)
    }

    /// Run minor collections until the active half has room for `n` cells.
    /// One collection is almost always enough; the loop covers the case of
    /// a nursery packed with survivors, which drain into the old
    /// generation as their ages cross the threshold.
    pub fn ensure_young(&mut self, n: usize, roots: &mut [CellRef]) -> Result<(), GcError> {
        while !self.young_has(n) {
            self.collect_minor(roots)?;
        }
        Ok(())
    }

    fn alloc_const(&mut self, tag: Tag) -> CellRef {
        let r = self.pop_free();
        assert!(!r.is_nil(), "old generation empty during constant setup");
        self[r] = Cell {
            age: OLD_AGE,
            ..Cell::nullary(tag)
        };
        r
    }

    fn pop_free(&mut self) -> CellRef {
        let head = self.free_head;
        if !head.is_nil() {
            self.free_head = self[head].l;
            self.free_count -= 1;
        }
        head
    }

    /// Append one chunk and thread its cells onto the freelist.
    fn add_chunk(&mut self) -> Result<(), GcError> {
        if self.old_capacity + self.chunk_size > self.max_old_cells {
            return Err(GcError::OutOfMemory {
                capacity: self.old_capacity,
                limit: self.max_old_cells,
            });
        }
        let base = self.young.len() + self.old_capacity;
        self.chunks
            .push(vec![Cell::nullary(Tag::Free); self.chunk_size].into_boxed_slice());
        for slot in 0..self.chunk_size {
            let r = CellRef::new(base + slot);
            let head = self.free_head;
            self[r].l = head;
            self.free_head = r;
        }
        self.free_count += self.chunk_size;
        self.old_capacity += self.chunk_size;
        self.stats.heap_chunks = self.chunks.len();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Minor collection (Cheney copy between the nursery halves)
    // -----------------------------------------------------------------------

    /// Copy the live nursery graph into the other half, aging and promoting
    /// as it goes. `roots` is updated in place with the moved handles.
    pub fn collect_minor(&mut self, roots: &mut [CellRef]) -> Result<(), GcError> {
        let start = Instant::now();
        self.stats.minor_collections += 1;
        let promoted_before = self.stats.cells_promoted;

        // Swap halves; from here to the end of the collection, `from_base`
        // and `young_next` describe the to-space being filled.
        self.from_base = if self.from_base == 0 { self.young_size } else { 0 };
        self.young_next = self.from_base;
        let mut scan = self.from_base;

        for i in 0..roots.len() {
            loop {
                match self.try_copy(roots[i]) {
                    Ok(moved) => {
                        roots[i] = moved;
                        break;
                    }
                    Err(NeedMajor) => self.collect_major(roots)?,
                }
            }
        }

        // Linear scan. A slot holding a forwarding record stands for a cell
        // promoted to the old generation; its children get fixed through
        // the record.
        while scan < self.young_next {
            let slot = CellRef::new(scan);
            scan += 1;
            let seen = self.young[slot.index()];
            let target = if seen.tag == Tag::Copied { seen.l } else { slot };
            let (trace_l, trace_r) = self[target].tag.links();
            if trace_l {
                loop {
                    match self.try_copy(self[target].l) {
                        Ok(moved) => {
                            self[target].l = moved;
                            break;
                        }
                        Err(NeedMajor) => self.collect_major(roots)?,
                    }
                }
            }
            if trace_r {
                loop {
                    match self.try_copy(self[target].r) {
                        Ok(moved) => {
                            self[target].r = moved;
                            break;
                        }
                        Err(NeedMajor) => self.collect_major(roots)?,
                    }
                }
            }
        }

        let slots = self.young_next - self.from_base;
        let promoted = self.stats.cells_promoted - promoted_before;
        self.stats.cells_copied += slots - promoted;
        self.stats.gc_time += start.elapsed();
        log::debug!(
            "minor gc: {} copied, {} promoted, freelist {}",
            slots - promoted,
            promoted,
            self.free_count
        );
        Ok(())
    }

    /// Move one cell out of from-space, or resolve it if already moved.
    /// Shallow: children are fixed later by the scan loop.
    fn try_copy(&mut self, r: CellRef) -> Result<CellRef, NeedMajor> {
        if r.is_nil() {
            return Ok(r);
        }
        let cell = self[r];
        if cell.age > AGE_MAX {
            return Ok(r); // old generation: never moves
        }
        if cell.tag == Tag::Copied {
            return Ok(cell.l);
        }
        debug_assert!(
            !self.in_active_half(r),
            "copying a cell already in to-space"
        );
        if cell.age == AGE_MAX {
            // Promote. The to-space slot this cell would have used is
            // burned on a forwarding record so the scan still reaches the
            // promoted cell's children. Its own children are at least as
            // old as it is, so they promote in this collection too and the
            // old generation never ends up pointing at the nursery.
            let dest = self.pop_free();
            if dest.is_nil() {
                return Err(NeedMajor);
            }
            self[dest] = Cell {
                age: OLD_AGE,
                mark: false,
                ..cell
            };
            self.stats.cells_promoted += 1;
            self.bump_to_space(Cell::unary(Tag::Copied, dest));
            self.young[r.index()] = Cell::unary(Tag::Copied, dest);
            Ok(dest)
        } else {
            let slot = self.bump_to_space(Cell {
                age: cell.age + 1,
                mark: false,
                ..cell
            });
            self.young[r.index()] = Cell::unary(Tag::Copied, slot);
            Ok(slot)
        }
    }

    fn bump_to_space(&mut self, cell: Cell) -> CellRef {
        // Each from-space cell consumes exactly one to-space slot (copy or
        // forwarding record), so a half never overflows.
        debug_assert!(self.young_next < self.from_base + self.young_size);
        let slot = CellRef::new(self.young_next);
        self.young_next += 1;
        self.young[slot.index()] = cell;
        slot
    }

    fn in_active_half(&self, r: CellRef) -> bool {
        let i = r.index();
        i >= self.from_base && i < self.from_base + self.young_size
    }

    // -----------------------------------------------------------------------
    // Major collection (mark–sweep over the old chunks)
    // -----------------------------------------------------------------------

    /// Mark from `roots` (plus the shared constants), sweep every chunk,
    /// then grow until at least a fifth of the old generation is free.
    ///
    /// Safe to run in the middle of a minor collection: marking follows
    /// forwarding records and walks from-space cells whose children have
    /// not been fixed yet, which still reaches exactly the live graph.
    pub fn collect_major(&mut self, roots: &[CellRef]) -> Result<(), GcError> {
        self.stats.major_collections += 1;

        let mut stack: Vec<CellRef> = Vec::with_capacity(64);
        stack.extend(roots.iter().copied());
        stack.extend(self.consts.as_array());

        // Expression trees can be millions of cells deep: tail-walk the
        // left chain, push only right children.
        while let Some(mut r) = stack.pop() {
            loop {
                if r.is_nil() {
                    break;
                }
                let cell = self[r];
                if cell.mark {
                    break;
                }
                self[r].mark = true;
                if cell.tag == Tag::Copied {
                    r = cell.l;
                    continue;
                }
                let (trace_l, trace_r) = cell.tag.links();
                if trace_r && !cell.r.is_nil() {
                    stack.push(cell.r);
                }
                if trace_l {
                    r = cell.l;
                } else {
                    break;
                }
            }
        }

        // Sweep: rebuild the freelist from scratch; unmarked old cells
        // (including the previous freelist) go back on it.
        self.free_head = CellRef::NIL;
        self.free_count = 0;
        let mut live = 0usize;
        let old_base = self.young.len();
        for index in old_base..old_base + self.old_capacity {
            let r = CellRef::new(index);
            if self[r].mark {
                self[r].mark = false;
                live += 1;
            } else {
                let head = self.free_head;
                self[r] = Cell {
                    l: head,
                    ..Cell::nullary(Tag::Free)
                };
                self.free_head = r;
                self.free_count += 1;
            }
        }
        self.stats.old_cells_live = live;

        for cell in &mut self.young {
            cell.mark = false;
        }

        log::info!(
            "major gc: {} live / {} old cells, {} free",
            live,
            self.old_capacity,
            self.free_count
        );

        while self.free_count * 5 < self.old_capacity {
            self.add_chunk()?;
            log::info!(
                "old generation grown to {} chunks ({} cells)",
                self.chunks.len(),
                self.old_capacity
            );
        }
        Ok(())
    }
}

impl Index<CellRef> for Heap {
    type Output = Cell;

    #[inline]
    fn index(&self, r: CellRef) -> &Cell {
        let i = r.index();
        if i < self.young.len() {
            &self.young[i]
        } else {
            let o = i - self.young.len();
            &self.chunks[o / self.chunk_size][o % self.chunk_size]
        }
    }
}

impl IndexMut<CellRef> for Heap {
    #[inline]
    fn index_mut(&mut self, r: CellRef) -> &mut Cell {
        let i = r.index();
        if i < self.young.len() {
            &mut self.young[i]
        } else {
            let o = i - self.young.len();
            &mut self.chunks[o / self.chunk_size][o % self.chunk_size]
        }
    }
}
