//! Per-shard allocator handle
//!
//! Every shard worker installs one `ShardAlloc` into the thread registry at
//! startup; all small-string payloads below are carved from its arena and
//! every heap allocation owned by a value envelope is accounted against it.
//! Handles are immovable once installed: a second install on the same
//! thread is a programming error.
//!
//! The arena hands out size-class chunks from 8 KiB blocks and tracks live
//! bytes per block, which is what `CompactValue::defrag_if_needed` consults
//! to decide whether an allocation sits on an underutilized block.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Arena block size
pub const BLOCK_SIZE: usize = 8 * 1024;

/// Largest allocation served by the arena; bigger payloads go to the
/// global allocator as boxed slices
pub const MAX_SMALL_ALLOC: usize = 512;

const CLASS_STEP: usize = 8;
const NUM_CLASSES: usize = MAX_SMALL_ALLOC / CLASS_STEP;

thread_local! {
    static CURRENT: RefCell<Option<Rc<ShardAlloc>>> = const { RefCell::new(None) };
}

/// Install the handle for the current thread. Panics if one is already
/// installed: handles are immovable for the life of the worker.
pub fn install(handle: Rc<ShardAlloc>) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "allocator handle already installed on this thread");
        *slot = Some(handle);
    });
}

/// The installed handle, or a fresh one installed on first use.
///
/// Shard workers install explicitly; tests and ad-hoc callers get a
/// default handle lazily.
pub fn current() -> Rc<ShardAlloc> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| Rc::new(ShardAlloc::new())).clone()
    })
}

struct Block {
    start: *mut u8,
    /// Bump offset of the next never-used byte
    bump: usize,
    /// Bytes currently live on this block
    live: usize,
}

struct ArenaInner {
    blocks: Vec<Block>,
    /// Free chunks per size class
    free_lists: Vec<Vec<*mut u8>>,
}

/// Per-shard allocator handle: small-string arena + byte accounting
pub struct ShardAlloc {
    inner: RefCell<ArenaInner>,
    /// Heap bytes owned by value envelopes (arena blocks included)
    used_bytes: Cell<usize>,
}

impl ShardAlloc {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(ArenaInner {
                blocks: Vec::new(),
                free_lists: vec![Vec::new(); NUM_CLASSES],
            }),
            used_bytes: Cell::new(0),
        }
    }

    fn class_of(len: usize) -> usize {
        debug_assert!(len > 0 && len <= MAX_SMALL_ALLOC);
        (len + CLASS_STEP - 1) / CLASS_STEP - 1
    }

    fn class_size(class: usize) -> usize {
        (class + 1) * CLASS_STEP
    }

    /// Allocate an arena chunk of at least `len` bytes (`len` must be
    /// within `MAX_SMALL_ALLOC`)
    pub fn alloc_small(&self, len: usize) -> *mut u8 {
        let class = Self::class_of(len);
        let size = Self::class_size(class);
        let mut inner = self.inner.borrow_mut();

        if let Some(ptr) = inner.free_lists[class].pop() {
            if let Some(block) = Self::block_of(&mut inner.blocks, ptr) {
                block.live += size;
            }
            return ptr;
        }

        // Bump from the newest block, or open a new one
        let need_new = match inner.blocks.last() {
            Some(block) => block.bump + size > BLOCK_SIZE,
            None => true,
        };
        if need_new {
            let layout = Layout::from_size_align(BLOCK_SIZE, CLASS_STEP).unwrap();
            let start = unsafe { alloc(layout) };
            assert!(!start.is_null(), "arena block allocation failed");
            inner.blocks.push(Block { start, bump: 0, live: 0 });
            self.used_bytes.set(self.used_bytes.get() + BLOCK_SIZE);
        }
        let block = inner.blocks.last_mut().unwrap();
        let ptr = unsafe { block.start.add(block.bump) };
        block.bump += size;
        block.live += size;
        ptr
    }

    /// Return an arena chunk of `len` logical bytes
    pub fn free_small(&self, ptr: *mut u8, len: usize) {
        let class = Self::class_of(len);
        let size = Self::class_size(class);
        let mut inner = self.inner.borrow_mut();
        if let Some(block) = Self::block_of(&mut inner.blocks, ptr) {
            debug_assert!(block.live >= size);
            block.live -= size;
        }
        inner.free_lists[class].push(ptr);
    }

    fn block_of<'a>(blocks: &'a mut [Block], ptr: *mut u8) -> Option<&'a mut Block> {
        blocks.iter_mut().find(|b| {
            let start = b.start as usize;
            let p = ptr as usize;
            p >= start && p < start + BLOCK_SIZE
        })
    }

    /// Live-byte ratio of the block holding `ptr`, in `[0, 1]`
    pub fn block_utilization(&self, ptr: *mut u8) -> f32 {
        let mut inner = self.inner.borrow_mut();
        match Self::block_of(&mut inner.blocks, ptr) {
            Some(block) => block.live as f32 / BLOCK_SIZE as f32,
            None => 1.0,
        }
    }

    /// Record a global-allocator allocation owned by an envelope
    pub fn note_alloc(&self, bytes: usize) {
        self.used_bytes.set(self.used_bytes.get() + bytes);
    }

    /// Record a global-allocator free
    pub fn note_free(&self, bytes: usize) {
        self.used_bytes.set(self.used_bytes.get().saturating_sub(bytes));
    }

    /// Heap bytes currently attributed to this shard
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.get()
    }
}

impl Default for ShardAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShardAlloc {
    fn drop(&mut self) {
        let inner = self.inner.borrow();
        let layout = Layout::from_size_align(BLOCK_SIZE, CLASS_STEP).unwrap();
        for block in &inner.blocks {
            unsafe { dealloc(block.start, layout) };
        }
    }
}
