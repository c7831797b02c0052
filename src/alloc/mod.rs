//! # Trampoline arena
//!
//! Allocates executable buffers near a given address, so a rel32 branch at
//! the patch site can always reach its trampoline.
//!
//! Blocks handed out by the arena are never freed or reused: once a
//! trampoline address has been published at a patch site, third-party hook
//! chains may have captured it, so retired trampolines are parked until
//! process exit rather than reclaimed.
//!
//! Proximity search adapted from detour-rs: https://github.com/darfink/detour-rs

use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

use self::proximity::ArenaError;

pub mod proximity;

/// A thread-safe pool of executable memory for trampolines.
pub struct PatchArena(Arc<Mutex<proximity::ProximityAllocator>>);

impl PatchArena {
    /// Creates a new arena whose blocks land within `max_distance` bytes of
    /// the requested origin.
    pub fn new(max_distance: usize) -> Self {
        PatchArena(Arc::new(Mutex::new(proximity::ProximityAllocator::new(
            max_distance,
        ))))
    }

    /// Allocates a read/write/executable block of `size` bytes close to
    /// `origin`. The block is owned by the arena for the life of the
    /// process.
    pub fn alloc_near(&self, origin: usize, size: usize) -> Result<ArenaBlock, ArenaError> {
        let mut allocator = self.0.lock().unwrap();
        allocator.allocate(origin, size)
    }
}

/// A block of executable arena memory.
///
/// Plain address + length: the backing storage is retained by the arena
/// forever, so a block never dangles and carries no lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ArenaBlock {
    /// Base address of the block.
    pub addr: usize,
    /// Length of the block in bytes.
    pub len: usize,
}

impl ArenaBlock {
    /// The block as a raw mutable pointer.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

/// The furthest distance between a patch site and its trampoline (2 GiB),
/// the reach of a rel32 branch.
pub const BRANCH_RANGE: usize = 0x8000_0000;

lazy_static! {
    /// Process-wide trampoline arena.
    static ref ARENA: PatchArena = PatchArena::new(BRANCH_RANGE);
}

/// Allocates an executable trampoline block near `origin` from the
/// process-wide arena.
///
/// Note: the returned block's content is undefined, but valid u8 values
pub fn alloc_exec(origin: usize, size: usize) -> Result<ArenaBlock, ArenaError> {
    ARENA.alloc_near(origin, size)
}
