//! Fixed-size cell allocator.
//!
//! A [`CellPool`] hands out cells of a single size carved from larger
//! superblocks obtained from the global allocator. Free cells are threaded
//! into an intrusive singly-linked list through their first word, so both
//! allocation and deallocation are O(1) and need no side tables.
//!
//! Superblocks are only returned to the system when the pool is dropped.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{fatal_error, AllocError};

/// Alignment of every superblock.
///
/// Cells within a superblock sit at multiples of the cell size, which is
/// itself a multiple of `size_of::<f64>()`, so every cell is suitably
/// aligned for any type with alignment up to 8.
pub const SUPERBLOCK_ALIGN: usize = 4096;

/// Header written into a cell while it is on the free list.
#[repr(C)]
struct FreeCell {
    next: Option<NonNull<FreeCell>>,
}

/// A pool of memory cells of one fixed size.
///
/// The pool does not know what lives in its cells; it is the back end of
/// node placement in [`Heap`](crate::Heap) and can be used on its own.
///
/// By default the free list is last-in-first-out, which keeps recently
/// touched cells hot in the cache. With the `cell-fifo` feature the list is
/// first-in-first-out instead, which maximises the time between a cell being
/// freed and reused.
pub struct CellPool {
    cell_size: usize,
    cells_per_superblock: usize,
    superblock_layout: Layout,
    superblocks: Vec<NonNull<u8>>,
    free_cells: Option<NonNull<FreeCell>>,
    #[cfg(feature = "cell-fifo")]
    last_free_cell: Option<NonNull<FreeCell>>,
    free_count: usize,
    cells_allocated: usize,
}

impl CellPool {
    /// Create an empty pool.
    ///
    /// `dbls_per_cell` is the cell size expressed as a multiple of
    /// `size_of::<f64>()`; doubles are used as the unit because they carry
    /// the most stringent alignment of the common scalar types. Memory is
    /// obtained in superblocks of `cells_per_superblock` cells.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero or the superblock size overflows.
    #[must_use]
    pub fn new(dbls_per_cell: usize, cells_per_superblock: usize) -> Self {
        assert!(dbls_per_cell >= 1, "cells must hold at least one double");
        assert!(
            cells_per_superblock >= 1,
            "superblocks must hold at least one cell"
        );
        let cell_size = dbls_per_cell * std::mem::size_of::<f64>();
        let superblock_size = cell_size
            .checked_mul(cells_per_superblock)
            .expect("superblock size overflows usize");
        let superblock_layout = Layout::from_size_align(superblock_size, SUPERBLOCK_ALIGN)
            .expect("Invalid superblock layout");

        Self {
            cell_size,
            cells_per_superblock,
            superblock_layout,
            superblocks: Vec::new(),
            free_cells: None,
            #[cfg(feature = "cell-fifo")]
            last_free_cell: None,
            free_count: 0,
            cells_allocated: 0,
        }
    }

    /// Allocate one cell, growing the pool by a superblock if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] if a new superblock is needed and
    /// the global allocator cannot supply it.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, AllocError> {
        let cell = match self.free_cells {
            Some(cell) => cell,
            None => self.seek_memory()?,
        };
        Ok(self.take(cell))
    }

    /// Allocate a cell only if one is available without growing the pool.
    ///
    /// Suitable for fast paths that must not themselves call into the
    /// system allocator.
    pub fn easy_allocate(&mut self) -> Option<NonNull<u8>> {
        self.free_cells.map(|cell| self.take(cell))
    }

    /// Return a cell to the pool. A null pointer is ignored.
    ///
    /// # Safety
    ///
    /// `p` must be null or a cell previously returned by `allocate` or
    /// `easy_allocate` on this pool and not deallocated since. The contents
    /// of the cell are clobbered.
    pub unsafe fn deallocate(&mut self, p: *mut u8) {
        let Some(cell) = NonNull::new(p) else {
            return;
        };
        #[cfg(feature = "paranoid-pool")]
        self.check_allocated_cell(cell);

        let cell = cell.cast::<FreeCell>();
        #[cfg(feature = "cell-fifo")]
        {
            // SAFETY: the caller guarantees `cell` is a cell of this pool,
            // large and aligned enough for a `FreeCell`.
            unsafe { cell.as_ptr().write(FreeCell { next: None }) };
            match self.last_free_cell {
                // SAFETY: `last` is the tail of our own free list.
                Some(last) => unsafe { (*last.as_ptr()).next = Some(cell) },
                None => self.free_cells = Some(cell),
            }
            self.last_free_cell = Some(cell);
        }
        #[cfg(not(feature = "cell-fifo"))]
        {
            // SAFETY: as above.
            unsafe {
                cell.as_ptr().write(FreeCell {
                    next: self.free_cells,
                });
            }
            self.free_cells = Some(cell);
        }
        self.free_count += 1;
        self.cells_allocated -= 1;
    }

    /// Sort the free list by address.
    ///
    /// Successive allocations then tend to fall in the same cache lines and
    /// pages. The allocation policy itself is unchanged.
    pub fn defragment(&mut self) {
        let mut cells = Vec::with_capacity(self.free_count);
        let mut cursor = self.free_cells;
        while let Some(cell) = cursor {
            cells.push(cell);
            // SAFETY: every cell on the free list holds a valid `FreeCell`.
            cursor = unsafe { cell.as_ref().next };
        }
        cells.sort_unstable_by_key(|cell| cell.as_ptr() as usize);

        let mut next = None;
        for &cell in cells.iter().rev() {
            // SAFETY: `cell` came from our free list.
            unsafe { (*cell.as_ptr()).next = next };
            next = Some(cell);
        }
        self.free_cells = next;
        #[cfg(feature = "cell-fifo")]
        {
            self.last_free_cell = cells.last().copied();
        }
    }

    /// Integrity check.
    ///
    /// Walks the free list, verifying that every free cell is a properly
    /// aligned cell of this pool and that the tallies balance. Any
    /// inconsistency is a fatal error; the return value exists so that the
    /// call can sit inside `debug_assert!`.
    pub fn check(&self) -> bool {
        let mut free = 0;
        let mut cursor = self.free_cells;
        while let Some(cell) = cursor {
            self.check_cell(cell.cast());
            free += 1;
            // SAFETY: `check_cell` confirmed the cell lies in a superblock.
            cursor = unsafe { cell.as_ref().next };
        }
        if free != self.free_count || self.cells_allocated + free != self.cells_provisioned() {
            fatal_error(format_args!(
                "CellPool::check(): internal inconsistency \
                 (allocated {}, free {free}, provisioned {})",
                self.cells_allocated,
                self.cells_provisioned()
            ));
        }
        true
    }

    /// Whether `p` is the start of a cell inside one of this pool's
    /// superblocks. Says nothing about whether the cell is allocated.
    #[must_use]
    pub fn owns(&self, p: *const u8) -> bool {
        self.locate(p) == Some(true)
    }

    /// Size of each cell in bytes.
    #[must_use]
    pub const fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Number of cells per superblock.
    #[must_use]
    pub const fn cells_per_superblock(&self) -> usize {
        self.cells_per_superblock
    }

    /// Size in bytes of each superblock.
    #[must_use]
    pub const fn superblock_size(&self) -> usize {
        self.superblock_layout.size()
    }

    /// Number of superblocks obtained so far.
    #[must_use]
    pub fn superblock_count(&self) -> usize {
        self.superblocks.len()
    }

    /// Number of cells currently handed out.
    #[must_use]
    pub const fn cells_allocated(&self) -> usize {
        self.cells_allocated
    }

    /// Number of cells on the free list.
    #[must_use]
    pub const fn free_cells(&self) -> usize {
        self.free_count
    }

    /// Total cells carved from all superblocks.
    #[must_use]
    pub fn cells_provisioned(&self) -> usize {
        self.superblocks.len() * self.cells_per_superblock
    }

    fn take(&mut self, cell: NonNull<FreeCell>) -> NonNull<u8> {
        // SAFETY: `cell` is the head of our free list.
        self.free_cells = unsafe { cell.as_ref().next };
        #[cfg(feature = "cell-fifo")]
        if self.free_cells.is_none() {
            self.last_free_cell = None;
        }
        self.free_count -= 1;
        self.cells_allocated += 1;
        cell.cast()
    }

    /// Obtain a superblock and thread its cells onto the (empty) free list.
    fn seek_memory(&mut self) -> Result<NonNull<FreeCell>, AllocError> {
        debug_assert!(self.free_cells.is_none());
        // SAFETY: the layout has non-zero size (both factors are >= 1).
        let raw = unsafe { alloc(self.superblock_layout) };
        let Some(superblock) = NonNull::new(raw) else {
            return Err(AllocError::OutOfMemory {
                bytes: self.superblock_layout.size(),
            });
        };
        self.superblocks.push(superblock);

        let mut next = None;
        for index in (0..self.cells_per_superblock).rev() {
            // SAFETY: `index * cell_size` is within the superblock, and the
            // offset keeps `FreeCell` alignment (see `SUPERBLOCK_ALIGN`).
            #[allow(clippy::cast_ptr_alignment)]
            let cell = unsafe { superblock.as_ptr().add(index * self.cell_size) }
                .cast::<FreeCell>();
            // SAFETY: as above; the memory is fresh and exclusively ours.
            unsafe { cell.write(FreeCell { next }) };
            next = NonNull::new(cell);
        }
        #[cfg(feature = "cell-fifo")]
        {
            let last = (self.cells_per_superblock - 1) * self.cell_size;
            // SAFETY: `last` is the offset of the final cell.
            self.last_free_cell =
                NonNull::new(unsafe { superblock.as_ptr().add(last) }.cast::<FreeCell>());
        }
        self.free_cells = next;
        self.free_count += self.cells_per_superblock;

        crate::tracing::internal::log_superblock(self.cell_size, self.superblocks.len());
        next.ok_or(AllocError::OutOfMemory {
            bytes: self.superblock_layout.size(),
        })
    }

    /// `Some(aligned)` if `p` lies inside a superblock, `None` otherwise.
    fn locate(&self, p: *const u8) -> Option<bool> {
        let addr = p as usize;
        self.superblocks.iter().find_map(|superblock| {
            let start = superblock.as_ptr() as usize;
            let offset = addr.checked_sub(start)?;
            (offset < self.superblock_layout.size()).then_some(offset % self.cell_size == 0)
        })
    }

    fn check_cell(&self, p: NonNull<u8>) {
        match self.locate(p.as_ptr()) {
            Some(true) => {}
            Some(false) => fatal_error("CellPool::check_cell: designated block is misaligned"),
            None => fatal_error(
                "CellPool::check_cell: designated block doesn't belong to this CellPool",
            ),
        }
    }

    #[cfg(feature = "paranoid-pool")]
    fn check_allocated_cell(&self, p: NonNull<u8>) {
        self.check_cell(p);
        let mut cursor = self.free_cells;
        while let Some(cell) = cursor {
            if cell.cast::<u8>() == p {
                fatal_error("CellPool::check_cell: designated block is (already) free");
            }
            // SAFETY: free-list cells hold valid `FreeCell`s.
            cursor = unsafe { cell.as_ref().next };
        }
    }
}

impl std::fmt::Debug for CellPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellPool")
            .field("cell_size", &self.cell_size)
            .field("cells_per_superblock", &self.cells_per_superblock)
            .field("superblocks", &self.superblocks.len())
            .field("cells_allocated", &self.cells_allocated)
            .field("free_cells", &self.free_count)
            .finish()
    }
}

impl Drop for CellPool {
    fn drop(&mut self) {
        // Dropping a pool with live cells is the owner's bug; it is not
        // diagnosed here because it is routine during process teardown.
        for superblock in &self.superblocks {
            // SAFETY: every superblock was obtained with this layout.
            unsafe { dealloc(superblock.as_ptr(), self.superblock_layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pool_is_empty() {
        let pool = CellPool::new(2, 32);
        assert_eq!(pool.cell_size(), 16);
        assert_eq!(pool.superblock_size(), 16 * 32);
        assert_eq!(pool.superblock_count(), 0);
        assert_eq!(pool.cells_allocated(), 0);
        assert_eq!(pool.free_cells(), 0);
    }

    #[test]
    fn test_easy_allocate_does_not_grow() {
        let mut pool = CellPool::new(1, 8);
        assert!(pool.easy_allocate().is_none());
        assert_eq!(pool.superblock_count(), 0);

        let cell = pool.allocate().unwrap();
        assert_eq!(pool.superblock_count(), 1);
        assert_eq!(pool.free_cells(), 7);

        let easy = pool.easy_allocate().unwrap();
        assert_ne!(cell, easy);
        assert_eq!(pool.cells_allocated(), 2);

        unsafe {
            pool.deallocate(cell.as_ptr());
            pool.deallocate(easy.as_ptr());
        }
        assert!(pool.check());
    }

    #[test]
    fn test_grows_by_whole_superblocks() {
        let mut pool = CellPool::new(1, 4);
        let cells: Vec<_> = (0..9).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.superblock_count(), 3);
        assert_eq!(pool.cells_provisioned(), 12);
        assert_eq!(pool.free_cells(), 3);
        for cell in cells {
            unsafe { pool.deallocate(cell.as_ptr()) };
        }
        assert_eq!(pool.cells_allocated(), 0);
        assert!(pool.check());
    }

    #[test]
    fn test_deallocate_null_is_noop() {
        let mut pool = CellPool::new(1, 4);
        unsafe { pool.deallocate(std::ptr::null_mut()) };
        assert_eq!(pool.cells_allocated(), 0);
        assert_eq!(pool.free_cells(), 0);
    }

    #[cfg(not(feature = "cell-fifo"))]
    #[test]
    fn test_lifo_reuse() {
        let mut pool = CellPool::new(1, 16);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        unsafe {
            pool.deallocate(a.as_ptr());
            pool.deallocate(b.as_ptr());
        }
        assert_eq!(pool.allocate().unwrap(), b);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[cfg(feature = "cell-fifo")]
    #[test]
    fn test_fifo_reuse() {
        let mut pool = CellPool::new(1, 2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        unsafe {
            pool.deallocate(a.as_ptr());
            pool.deallocate(b.as_ptr());
        }
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.allocate().unwrap(), b);
    }

    #[test]
    fn test_defragment_sorts_free_list() {
        let mut pool = CellPool::new(1, 8);
        let cells: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
        for cell in cells.iter().rev().step_by(2) {
            unsafe { pool.deallocate(cell.as_ptr()) };
        }
        pool.defragment();
        assert!(pool.check());

        let mut previous = 0usize;
        while let Some(cell) = pool.easy_allocate() {
            let addr = cell.as_ptr() as usize;
            assert!(addr > previous, "free list not in address order");
            previous = addr;
        }
        assert_eq!(pool.cells_allocated(), 8);
    }

    #[test]
    fn test_cells_are_aligned_and_owned() {
        let mut pool = CellPool::new(3, 10);
        let cells: Vec<_> = (0..25).map(|_| pool.allocate().unwrap()).collect();
        for cell in &cells {
            assert!(pool.owns(cell.as_ptr()));
            assert_eq!(cell.as_ptr() as usize % std::mem::align_of::<f64>(), 0);
        }
        let inside = unsafe { cells[0].as_ptr().add(1) };
        assert!(!pool.owns(inside));
        assert!(!pool.owns(std::ptr::null()));
        for cell in cells {
            unsafe { pool.deallocate(cell.as_ptr()) };
        }
    }

    #[test]
    #[should_panic(expected = "doesn't belong")]
    fn test_check_detects_foreign_cell() {
        let mut pool = CellPool::new(1, 4);
        let mut foreign = [0u64; 2];
        let _cell = pool.allocate().unwrap();
        // Push a cell that belongs to no superblock.
        unsafe { pool.deallocate(foreign.as_mut_ptr().cast()) };
        pool.check();
    }
}
