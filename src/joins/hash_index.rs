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

//! The bucket array of the hash table: a power-of-two array of chain heads.
//!
//! Each slot holds the address of the first row of the chain for `hash &
//! bitmask`, or zero for an empty chain. Insertion threads the chain through
//! the rows themselves: each row's next pointer overlays its hash slot, so
//! inserting a row stores the old head into the row and the row's address
//! into the slot. Construction is single-threaded; probes are read-only.

use crate::buffer::{BufferManager, PinnedHandle};
use crate::error::Result;
use crate::row::layout::RowLayout;
use crate::row::ops::{read_u64, write_u64};

/// Power-of-two sized array of chain-head row addresses
pub struct HashIndex {
    handle: PinnedHandle,
    capacity: usize,
    bitmask: u64,
}

impl HashIndex {
    /// Allocate a zeroed bucket array sized for `count` rows: at least twice
    /// the row count, and at least one block's worth of pointers.
    pub fn new(
        buffer_manager: &BufferManager,
        count: usize,
        block_size: usize,
    ) -> Result<Self> {
        let capacity = (count * 2).max(block_size / 8 + 1).next_power_of_two();
        let handle = buffer_manager.allocate(capacity * 8)?;
        Ok(Self {
            handle,
            capacity,
            bitmask: capacity as u64 - 1,
        })
    }

    /// Number of slots; always a power of two
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `capacity - 1`
    pub fn bitmask(&self) -> u64 {
        self.bitmask
    }

    #[inline]
    fn slot(&self, hash: u64) -> u64 {
        self.handle.ptr() as u64 + (hash & self.bitmask) * 8
    }

    /// Head of the chain for `hash`, or zero for an empty chain
    #[inline]
    pub fn chain_head(&self, hash: u64) -> u64 {
        unsafe { read_u64(self.slot(hash)) }
    }

    /// Insert `count` rows starting at `base` in row scan order. Each row's
    /// stored hash picks the slot; the old head becomes the row's next
    /// pointer and the row becomes the new head.
    pub fn insert_rows(&self, layout: &RowLayout, base: u64, count: usize) {
        let pointer_offset = layout.pointer_offset() as u64;
        let row_width = layout.row_width() as u64;
        for r in 0..count {
            let row = base + r as u64 * row_width;
            unsafe {
                let hash = read_u64(row + pointer_offset);
                let slot = self.slot(hash);
                // the hash slot becomes the next pointer
                write_u64(row + pointer_offset, read_u64(slot));
                write_u64(slot, row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType;

    #[test]
    fn capacity_is_a_power_of_two_with_headroom() {
        let bm = BufferManager::new();
        let index = HashIndex::new(&bm, 1000, 1024).unwrap();
        assert!(index.capacity().is_power_of_two());
        assert!(index.capacity() >= 2000);
        assert_eq!(index.bitmask(), index.capacity() as u64 - 1);
    }

    #[test]
    fn empty_index_has_null_heads() {
        let bm = BufferManager::new();
        let index = HashIndex::new(&bm, 0, 64).unwrap();
        for hash in [0u64, 1, 42, u64::MAX] {
            assert_eq!(index.chain_head(hash), 0);
        }
    }

    #[test]
    fn colliding_rows_chain_in_reverse_insert_order() {
        let bm = BufferManager::new();
        let layout = RowLayout::try_new(vec![DataType::Int64], false).unwrap();
        let index = HashIndex::new(&bm, 3, 64).unwrap();

        // three rows with identical hashes
        let rows = bm.allocate(3 * layout.row_width()).unwrap();
        let base = rows.ptr() as u64;
        let hash = 0xfeed_u64;
        for r in 0..3u64 {
            unsafe {
                write_u64(
                    base + r * layout.row_width() as u64 + layout.hash_offset() as u64,
                    hash,
                )
            };
        }
        index.insert_rows(&layout, base, 3);

        // chain: row2 -> row1 -> row0 -> null
        let row_width = layout.row_width() as u64;
        let head = index.chain_head(hash);
        assert_eq!(head, base + 2 * row_width);
        unsafe {
            let next = read_u64(head + layout.pointer_offset() as u64);
            assert_eq!(next, base + row_width);
            let next = read_u64(next + layout.pointer_offset() as u64);
            assert_eq!(next, base);
            let next = read_u64(next + layout.pointer_offset() as u64);
            assert_eq!(next, 0);
        }
    }
}
