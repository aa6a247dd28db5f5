// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Buffer manager backing the row and heap blocks of the join.
//!
//! Blocks are fixed-capacity byte buffers addressed through [`BlockHandle`]s.
//! A block must be pinned to obtain a stable address; unpinned blocks may be
//! moved to a backing store at any time and are reloaded at a *different*
//! address on the next pin. Swizzled row data stays valid across an
//! evict/reload cycle; unswizzled row data does not, which is the entire
//! reason the partitioned build path swizzles pointers before letting go of
//! its pins.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;

/// Where the bytes of a block currently live
enum BlockState {
    /// In memory, address-stable while pinned
    Resident(Box<[u8]>),
    /// Paged out to the backing store
    Evicted(Vec<u8>),
}

struct BlockInner {
    pins: usize,
    state: BlockState,
}

/// Handle to a buffer-managed block of `capacity` bytes
pub struct BlockHandle {
    id: u64,
    capacity: usize,
    used: Arc<AtomicUsize>,
    inner: Mutex<BlockInner>,
}

impl BlockHandle {
    /// Unique id of this block
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte capacity of this block
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        if matches!(self.inner.get_mut().state, BlockState::Resident(_)) {
            self.used.fetch_sub(self.capacity, Ordering::Relaxed);
        }
    }
}

/// A pinned block. The address returned by [`PinnedHandle::ptr`] is stable
/// for as long as this handle is alive; dropping it releases the pin.
pub struct PinnedHandle {
    block: Arc<BlockHandle>,
    ptr: *mut u8,
}

// The pointer targets the block's resident allocation, which cannot be freed
// or moved while the pin count is non-zero.
unsafe impl Send for PinnedHandle {}
unsafe impl Sync for PinnedHandle {}

impl PinnedHandle {
    /// Base address of the pinned block
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Byte capacity of the pinned block
    pub fn capacity(&self) -> usize {
        self.block.capacity
    }

    /// The block this pin refers to
    pub fn block(&self) -> &Arc<BlockHandle> {
        &self.block
    }
}

impl Drop for PinnedHandle {
    fn drop(&mut self) {
        let mut inner = self.block.inner.lock();
        inner.pins -= 1;
    }
}

/// Registry of buffer-managed blocks with a soft memory target.
///
/// The target does not make allocations fail; it is consulted by the
/// partitioned build path to size partitions, and going over it triggers a
/// best-effort eviction sweep of unpinned blocks.
pub struct BufferManager {
    memory_limit: usize,
    used: Arc<AtomicUsize>,
    next_block_id: AtomicU64,
    blocks: Mutex<Vec<Weak<BlockHandle>>>,
}

impl BufferManager {
    /// Create a buffer manager with an effectively unbounded memory target
    pub fn new() -> Arc<Self> {
        Self::with_memory_limit(usize::MAX)
    }

    /// Create a buffer manager with the given soft memory target in bytes
    pub fn with_memory_limit(memory_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            memory_limit,
            used: Arc::new(AtomicUsize::new(0)),
            next_block_id: AtomicU64::new(0),
            blocks: Mutex::new(Vec::new()),
        })
    }

    /// The soft memory target in bytes
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Bytes currently resident
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Register a new zero-initialized block of `capacity` bytes
    pub fn register_block(&self, capacity: usize) -> Result<Arc<BlockHandle>> {
        if self
            .used
            .load(Ordering::Relaxed)
            .saturating_add(capacity)
            > self.memory_limit
        {
            self.evict_unpinned();
        }
        let block = Arc::new(BlockHandle {
            id: self.next_block_id.fetch_add(1, Ordering::Relaxed),
            capacity,
            used: Arc::clone(&self.used),
            inner: Mutex::new(BlockInner {
                pins: 0,
                state: BlockState::Resident(vec![0u8; capacity].into_boxed_slice()),
            }),
        });
        self.used.fetch_add(capacity, Ordering::Relaxed);
        let mut blocks = self.blocks.lock();
        blocks.retain(|w| w.strong_count() > 0);
        blocks.push(Arc::downgrade(&block));
        Ok(block)
    }

    /// Allocate a new block and pin it in one step
    pub fn allocate(&self, capacity: usize) -> Result<PinnedHandle> {
        let block = self.register_block(capacity)?;
        self.pin(&block)
    }

    /// Pin `block`, reloading it from the backing store if it was evicted.
    /// The returned address is only meaningful for this pin's lifetime.
    pub fn pin(&self, block: &Arc<BlockHandle>) -> Result<PinnedHandle> {
        let mut inner = block.inner.lock();
        if let BlockState::Evicted(bytes) = &inner.state {
            // reload at a fresh address
            let resident = bytes.clone().into_boxed_slice();
            inner.state = BlockState::Resident(resident);
            self.used.fetch_add(block.capacity, Ordering::Relaxed);
        }
        inner.pins += 1;
        let ptr = match &mut inner.state {
            BlockState::Resident(data) => data.as_mut_ptr(),
            BlockState::Evicted(_) => unreachable!("pinned block must be resident"),
        };
        Ok(PinnedHandle {
            block: Arc::clone(block),
            ptr,
        })
    }

    /// Move every resident, unpinned block to the backing store. Addresses of
    /// evicted blocks are invalidated; swizzled contents survive the round
    /// trip.
    pub fn evict_unpinned(&self) {
        let blocks: Vec<Arc<BlockHandle>> = {
            let mut guard = self.blocks.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(|w| w.upgrade()).collect()
        };
        for block in blocks {
            let mut inner = block.inner.lock();
            if inner.pins > 0 {
                continue;
            }
            if let BlockState::Resident(data) = &inner.state {
                let bytes = data.to_vec();
                inner.state = BlockState::Evicted(bytes);
                self.used.fetch_sub(block.capacity, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_gives_stable_writable_memory() {
        let bm = BufferManager::new();
        let block = bm.register_block(64).unwrap();
        let pin = bm.pin(&block).unwrap();
        unsafe {
            *pin.ptr() = 42;
            *pin.ptr().add(63) = 7;
        }
        let pin2 = bm.pin(&block).unwrap();
        assert_eq!(pin.ptr(), pin2.ptr());
        unsafe {
            assert_eq!(*pin2.ptr(), 42);
            assert_eq!(*pin2.ptr().add(63), 7);
        }
    }

    #[test]
    fn evict_skips_pinned_blocks() {
        let bm = BufferManager::new();
        let block = bm.register_block(16).unwrap();
        let pin = bm.pin(&block).unwrap();
        unsafe { *pin.ptr() = 1 };
        let before = pin.ptr();
        bm.evict_unpinned();
        let pin2 = bm.pin(&block).unwrap();
        assert_eq!(before, pin2.ptr());
    }

    #[test]
    fn evicted_block_reloads_contents() {
        let bm = BufferManager::new();
        let block = bm.register_block(16).unwrap();
        {
            let pin = bm.pin(&block).unwrap();
            unsafe { *pin.ptr().add(3) = 99 };
        }
        bm.evict_unpinned();
        let pin = bm.pin(&block).unwrap();
        unsafe { assert_eq!(*pin.ptr().add(3), 99) };
    }

    #[test]
    fn used_accounting_tracks_residency() {
        let bm = BufferManager::new();
        let block = bm.register_block(128).unwrap();
        assert_eq!(bm.used(), 128);
        bm.evict_unpinned();
        assert_eq!(bm.used(), 0);
        let _pin = bm.pin(&block).unwrap();
        assert_eq!(bm.used(), 128);
    }
}
