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

//! [`RowCollection`]: an append-only sequence of fixed-capacity blocks of row
//! bytes, or of variable-sized heap blobs when used as a string heap.
//!
//! A collection is either *live* (rows carry absolute heap addresses, only
//! valid while the heap blocks stay pinned) or *swizzled* (addresses replaced
//! by offsets, blocks evictable). The collection itself does not track which;
//! the owning hash table keeps separate live and swizzled collections and
//! moves blocks between them.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{BlockHandle, BufferManager, PinnedHandle};
use crate::error::Result;

/// One block of the collection and its bookkeeping
pub struct RowBlock {
    /// The buffer-managed block
    pub block: Arc<BlockHandle>,
    /// Capacity in entries
    pub capacity: usize,
    /// Number of entries written
    pub count: usize,
    /// Bytes written; only interesting for heap blocks, where entries are
    /// variable-sized
    pub byte_offset: usize,
}

pub(crate) struct RowCollectionInner {
    pub count: usize,
    pub blocks: Vec<RowBlock>,
    pub pinned_blocks: Vec<PinnedHandle>,
}

/// Append-only, merge-stealing collection of row blocks
pub struct RowCollection {
    buffer_manager: Arc<BufferManager>,
    block_capacity: usize,
    entry_size: usize,
    keep_pinned: bool,
    inner: Mutex<RowCollectionInner>,
}

impl RowCollection {
    /// Create a collection whose blocks hold `block_capacity` entries of
    /// `entry_size` bytes. `keep_pinned` collections retain a pin on every
    /// block for their lifetime, so absolute addresses into them stay valid;
    /// the live string heap needs this.
    pub fn new(
        buffer_manager: Arc<BufferManager>,
        block_capacity: usize,
        entry_size: usize,
        keep_pinned: bool,
    ) -> Self {
        Self {
            buffer_manager,
            block_capacity,
            entry_size,
            keep_pinned,
            inner: Mutex::new(RowCollectionInner {
                count: 0,
                blocks: Vec::new(),
                pinned_blocks: Vec::new(),
            }),
        }
    }

    /// A new, empty collection with the same parameters
    pub fn copy_empty(&self) -> Self {
        Self::new(
            Arc::clone(&self.buffer_manager),
            self.block_capacity,
            self.entry_size,
            self.keep_pinned,
        )
    }

    pub(crate) fn from_blocks(
        buffer_manager: Arc<BufferManager>,
        block_capacity: usize,
        entry_size: usize,
        keep_pinned: bool,
        blocks: Vec<RowBlock>,
    ) -> Self {
        let count = blocks.iter().map(|b| b.count).sum();
        Self {
            buffer_manager,
            block_capacity,
            entry_size,
            keep_pinned,
            inner: Mutex::new(RowCollectionInner {
                count,
                blocks,
                pinned_blocks: Vec::new(),
            }),
        }
    }

    /// Number of entries in the collection
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Number of blocks in the collection
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Bytes of row data written into the collection
    pub fn size_in_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner.blocks.iter().map(|b| b.byte_offset).sum()
    }

    /// Entries per block
    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    /// Bytes per entry (1 for heap collections)
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub(crate) fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    pub(crate) fn keep_pinned(&self) -> bool {
        self.keep_pinned
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, RowCollectionInner> {
        self.inner.lock()
    }

    /// Reserve `count` entries and write their addresses into `locations`.
    /// For heap collections `entry_sizes` gives the size of each reservation
    /// and a reservation never straddles a block boundary. The returned pins
    /// must be kept alive while the caller writes through `locations`.
    pub fn build(
        &self,
        count: usize,
        locations: &mut [u64],
        entry_sizes: Option<&[usize]>,
    ) -> Result<Vec<PinnedHandle>> {
        debug_assert!(locations.len() >= count);
        let mut inner = self.inner.lock();
        let mut handles: Vec<PinnedHandle> = Vec::new();
        // pin the block that still has room, if any
        let mut current: Option<(usize, PinnedHandle)> = match inner.blocks.len() {
            0 => None,
            n => {
                let last = &inner.blocks[n - 1];
                let full = match entry_sizes {
                    None => last.count == last.capacity,
                    // heap blocks are closed lazily when a blob does not fit
                    Some(sizes) => {
                        count > 0
                            && last.byte_offset + sizes[0]
                                > last.capacity * self.entry_size
                    }
                };
                if full {
                    None
                } else {
                    let pin = self.buffer_manager.pin(&last.block)?;
                    Some((n - 1, pin))
                }
            }
        };

        for i in 0..count {
            let size = match entry_sizes {
                None => self.entry_size,
                Some(sizes) => sizes[i],
            };
            let fits = match &current {
                None => false,
                Some((block_idx, _)) => {
                    let block = &inner.blocks[*block_idx];
                    match entry_sizes {
                        None => block.count < block.capacity,
                        Some(_) => {
                            block.byte_offset + size <= block.capacity * self.entry_size
                        }
                    }
                }
            };
            if !fits {
                if let Some((_, pin)) = current.take() {
                    handles.push(pin);
                }
                let capacity = match entry_sizes {
                    None => self.block_capacity,
                    Some(_) => self.block_capacity.max(size),
                };
                let block = self
                    .buffer_manager
                    .register_block(capacity * self.entry_size)?;
                if self.keep_pinned {
                    inner.pinned_blocks.push(self.buffer_manager.pin(&block)?);
                }
                let pin = self.buffer_manager.pin(&block)?;
                inner.blocks.push(RowBlock {
                    block,
                    capacity,
                    count: 0,
                    byte_offset: 0,
                });
                current = Some((inner.blocks.len() - 1, pin));
            }
            let (block_idx, pin) = current.as_ref().unwrap();
            let block = &mut inner.blocks[*block_idx];
            locations[i] = pin.ptr() as u64 + block.byte_offset as u64;
            block.count += 1;
            block.byte_offset += size;
        }
        inner.count += count;
        if let Some((_, pin)) = current.take() {
            handles.push(pin);
        }
        Ok(handles)
    }

    /// Steal all blocks from `other`, leaving it empty. Thread-safe per
    /// collection; block moves transfer ownership atomically under both
    /// collection locks.
    pub fn merge(&self, other: &RowCollection) {
        if std::ptr::eq(self, other) {
            return;
        }
        let mut other_inner = other.inner.lock();
        let mut inner = self.inner.lock();
        inner.count += other_inner.count;
        inner.blocks.append(&mut other_inner.blocks);
        inner.pinned_blocks.append(&mut other_inner.pinned_blocks);
        other_inner.count = 0;
    }

    /// Drop all blocks and pins
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.blocks.clear();
        inner.pinned_blocks.clear();
        inner.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(block_capacity: usize, entry_size: usize) -> RowCollection {
        RowCollection::new(BufferManager::new(), block_capacity, entry_size, false)
    }

    #[test]
    fn build_spans_blocks() {
        let c = collection(4, 8);
        let mut locations = vec![0u64; 10];
        let _handles = c.build(10, &mut locations, None).unwrap();
        assert_eq!(c.count(), 10);
        assert_eq!(c.block_count(), 3);
        // entries within a block are entry_size apart
        assert_eq!(locations[1] - locations[0], 8);
        assert!(locations.iter().all(|&p| p != 0));
    }

    #[test]
    fn build_reuses_partial_block() {
        let c = collection(4, 8);
        let mut locations = vec![0u64; 2];
        c.build(2, &mut locations, None).unwrap();
        c.build(2, &mut locations, None).unwrap();
        assert_eq!(c.block_count(), 1);
        assert_eq!(c.count(), 4);
    }

    #[test]
    fn heap_blob_never_straddles_blocks() {
        let c = collection(16, 1);
        let mut locations = vec![0u64; 3];
        // 10 + 10 cannot share a 16-byte block
        c.build(3, &mut locations, Some(&[10, 10, 4])).unwrap();
        assert_eq!(c.block_count(), 2);
        let inner = c.inner();
        assert_eq!(inner.blocks[0].byte_offset, 10);
        assert_eq!(inner.blocks[1].byte_offset, 14);
    }

    #[test]
    fn oversized_blob_gets_oversized_block() {
        let c = collection(16, 1);
        let mut locations = vec![0u64; 1];
        c.build(1, &mut locations, Some(&[100])).unwrap();
        let inner = c.inner();
        assert_eq!(inner.blocks[0].capacity, 100);
    }

    #[test]
    fn merge_steals_blocks() {
        let a = collection(4, 8);
        let b = a.copy_empty();
        let mut locations = vec![0u64; 6];
        a.build(3, &mut locations, None).unwrap();
        b.build(6, &mut locations, None).unwrap();
        a.merge(&b);
        assert_eq!(a.count(), 9);
        assert_eq!(b.count(), 0);
        assert_eq!(b.block_count(), 0);
        assert_eq!(a.block_count(), 3);
    }

    #[test]
    fn size_in_bytes_counts_written_bytes() {
        let c = collection(4, 8);
        let mut locations = vec![0u64; 5];
        c.build(5, &mut locations, None).unwrap();
        assert_eq!(c.size_in_bytes(), 40);
    }

    #[test]
    fn keep_pinned_retains_pins() {
        let bm = BufferManager::new();
        let c = RowCollection::new(Arc::clone(&bm), 16, 1, true);
        let mut locations = vec![0u64; 1];
        let handles = c.build(1, &mut locations, Some(&[8])).unwrap();
        drop(handles);
        // the collection's retained pin keeps the block resident
        bm.evict_unpinned();
        assert_eq!(bm.used(), 16);
    }
}
