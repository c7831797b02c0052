//! Proximity allocator
//!
//! Adapted from detour-rs with modifications: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use super::ArenaBlock;

/// Errors that occur while creating trampoline allocations.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Ran out of memory within an acceptable proximity to the allocation
    /// location.
    #[error("out of executable memory near the requested address")]
    OutOfMemory,
    /// Error while mapping a new executable pool.
    #[error("{0}")]
    Mmap(mmap::MapError),
    /// Error while querying a memory region.
    #[error("error querying memory region")]
    Region(#[from] region::Error),
}

/// Shared allocator state: every pool, and every block ever handed out.
pub struct ProximityAllocator {
    /// Max distance away from the origin that a pool can be.
    max_distance: usize,
    /// Executable memory pools, created on demand near requested origins.
    pools: Vec<SlicePool<u8>>,
    /// Blocks handed out so far. Held forever: dropping a `SliceBox` would
    /// return its bytes to the pool for reuse, and trampoline addresses must
    /// stay unique for the life of the process.
    parked: Vec<SliceBox<u8>>,
}

impl ProximityAllocator {
    /// Creates an empty allocator with the given proximity bound.
    pub fn new(max_distance: usize) -> Self {
        ProximityAllocator {
            max_distance,
            pools: Vec::new(),
            parked: Vec::new(),
        }
    }

    /// Allocates a block in an eligible pool, creating a new pool near
    /// `origin` when no existing one can serve the request.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<ArenaBlock, ArenaError> {
        let range = (origin.saturating_sub(self.max_distance))
            ..(origin.saturating_add(self.max_distance));

        let boxed = match self.allocate_pooled(&range, size) {
            Ok(boxed) => boxed,
            Err(ArenaError::OutOfMemory) => {
                // no existing pool fits: map a new one inside the range
                let pool = Self::allocate_pool(&range, origin, size)?;
                let boxed = pool.alloc(size).ok_or(ArenaError::OutOfMemory)?;
                self.pools.push(pool);
                boxed
            }
            Err(e) => return Err(e),
        };

        let block = ArenaBlock {
            addr: boxed.as_ptr() as usize,
            len: boxed.len(),
        };
        self.parked.push(boxed);
        Ok(block)
    }

    /// Tries to allocate from any existing pool within the range.
    fn allocate_pooled(
        &mut self,
        range: &Range<usize>,
        size: usize,
    ) -> Result<SliceBox<u8>, ArenaError> {
        // Returns true if the pool's memory is within the range
        let is_pool_in_range = |pool: &SlicePool<u8>| {
            let lower = pool.as_ptr() as usize;
            let upper = lower + pool.len();
            range.contains(&lower) && range.contains(&(upper - 1))
        };

        self.pools
            .iter_mut()
            .filter_map(|pool| {
                if is_pool_in_range(pool) {
                    pool.alloc(size)
                } else {
                    None
                }
            })
            .next()
            .ok_or(ArenaError::OutOfMemory)
    }

    /// Maps a new executable pool close to `origin`.
    fn allocate_pool(
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, ArenaError> {
        // size each pool for many trampolines, not one
        let pool_size = size.max(POOL_SIZE);

        let after = free_regions(origin, range.clone(), Direction::After);
        let before = free_regions(origin, range.clone(), Direction::Before);

        // Try to allocate after the specified address first (mostly because
        // macOS cannot allocate memory before the process's address).
        after
            .chain(before)
            .find_map(|result| match result {
                Ok(address) => Self::map_fixed_pool(address, pool_size).ok().map(Ok),
                Err(error) => Some(Err(ArenaError::Region(error))),
            })
            .unwrap_or(Err(ArenaError::OutOfMemory))
    }

    /// Tries to map read/write/executable memory at the specified address.
    fn map_fixed_pool(address: *const (), size: usize) -> Result<SlicePool<u8>, ArenaError> {
        mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const _),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => ArenaError::OutOfMemory,
            e => ArenaError::Mmap(e),
        })
        .map(SliceableMemoryMap)
        .map(SlicePool::new)
    }
}

/// Default size of a newly mapped trampoline pool.
const POOL_SIZE: usize = 0x1000;

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl SliceableMemoryMap {
    /// Get a slice of the memory map
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }

    /// Get a mutable slice of the memory map
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}

/// Direction for the free-region search.
#[allow(clippy::missing_docs_in_private_items)]
enum Direction {
    Before,
    After,
}

/// Returns an iterator over free regions on one side of `origin`, bounded
/// by `range`.
fn free_regions(
    origin: usize,
    range: Range<usize>,
    direction: Direction,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter {
        range,
        current: origin,
        direction,
    }
}

/// An iterator searching for unmapped regions near an origin.
struct FreeRegionIter {
    /// Range we're iterating over
    range: Range<usize>,
    /// Current location in the search
    current: usize,
    /// Direction we're searching
    direction: Direction,
}

impl Iterator for FreeRegionIter {
    type Item = Result<*const (), region::Error>;

    /// Returns the closest free region for the current address.
    fn next(&mut self) -> Option<Self::Item> {
        let page_size = region::page::size();

        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const ()) {
                Ok(region) => {
                    self.current = match self.direction {
                        Direction::Before => region.as_range().start.saturating_sub(page_size),
                        Direction::After => region.as_range().end,
                    }
                }
                Err(error) => {
                    // Check whether the region is free, otherwise return the error
                    let result = Some(match error {
                        region::Error::UnmappedRegion => Ok(self.current as *const _),
                        inner => Err(inner),
                    });

                    // Adjust the offset for repeated calls.
                    self.current = match self.direction {
                        Direction::Before => self.current.saturating_sub(page_size),
                        Direction::After => self.current + page_size,
                    };

                    return result;
                }
            }
        }

        None
    }
}
