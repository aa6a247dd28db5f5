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

//! Radix partitioning over the stored row hashes.
//!
//! Rows are routed by the top `R` bits of their 64-bit hash, which keeps
//! partition membership stable while `R` shrinks: reducing the histogram from
//! `R` to `R - 1` bits is a pairwise sum, and a row's partition at `R - 1`
//! bits is its partition at `R` bits divided by two.

use std::sync::Arc;

use crate::buffer::PinnedHandle;
use crate::error::Result;
use crate::internal_err;
use crate::row::collection::{RowBlock, RowCollection};
use crate::row::layout::RowLayout;
use crate::row::ops::{read_u32, read_u64, write_u64};

/// Default starting radix bits
pub const INITIAL_RADIX_BITS: usize = 6;

/// Stateless operations over a hash column
pub struct RadixPartitioning;

impl RadixPartitioning {
    /// Number of partitions at `radix_bits`
    pub fn num_partitions(radix_bits: usize) -> usize {
        1 << radix_bits
    }

    /// Partition of `hash`: its top `radix_bits` bits
    #[inline]
    pub fn partition_index(hash: u64, radix_bits: usize) -> usize {
        debug_assert!(radix_bits >= 1 && radix_bits < 64);
        (hash >> (64 - radix_bits)) as usize
    }

    /// A zero-filled histogram of `2^radix_bits` counters
    pub fn initialize_histogram(radix_bits: usize) -> Vec<u64> {
        vec![0; Self::num_partitions(radix_bits)]
    }

    /// Count the selected hashes into `histogram`
    pub fn update_histogram(
        hashes: &[u64],
        sel: &[usize],
        histogram: &mut [u64],
        radix_bits: usize,
    ) {
        debug_assert_eq!(histogram.len(), Self::num_partitions(radix_bits));
        for &idx in sel {
            histogram[Self::partition_index(hashes[idx], radix_bits)] += 1;
        }
    }

    /// Reduce a histogram from `from_bits` to `to_bits` by pairwise
    /// summation. Associative: reducing in steps or at once gives the same
    /// counters.
    pub fn reduce_histogram(
        histogram: &[u64],
        from_bits: usize,
        to_bits: usize,
    ) -> Result<Vec<u64>> {
        if to_bits > from_bits || to_bits == 0 {
            return internal_err!(
                "cannot reduce histogram from {from_bits} to {to_bits} bits"
            );
        }
        let mut current = histogram.to_vec();
        for _ in to_bits..from_bits {
            current = current.chunks(2).map(|pair| pair[0] + pair[1]).collect();
        }
        Ok(current)
    }

    /// Split `sel` into rows whose partition index is below `cutoff`
    /// (`true_sel`) and the rest (`false_sel`), returning the true count
    pub fn select(
        hashes: &[u64],
        sel: &[usize],
        radix_bits: usize,
        cutoff: usize,
        true_sel: &mut Vec<usize>,
        false_sel: &mut Vec<usize>,
    ) -> usize {
        true_sel.clear();
        false_sel.clear();
        for &idx in sel {
            if Self::partition_index(hashes[idx], radix_bits) < cutoff {
                true_sel.push(idx);
            } else {
                false_sel.push(idx);
            }
        }
        true_sel.len()
    }

    /// Route every row of a *swizzled* block/heap collection pair into one of
    /// `2^radix_bits` output pairs by the top bits of its stored hash.
    ///
    /// Row order within each source block is preserved per partition, and the
    /// output keeps the `blocks[i] ↔ heap_blocks[i]` pairing invariant: a
    /// data block and its heap block are opened and closed together.
    pub fn partition(
        layout: &RowLayout,
        source: &RowCollection,
        source_heap: &RowCollection,
        radix_bits: usize,
    ) -> Result<(Vec<RowCollection>, Vec<RowCollection>)> {
        let num_partitions = Self::num_partitions(radix_bits);
        let buffer_manager = Arc::clone(source.buffer_manager());
        let row_width = layout.row_width();
        let all_constant = layout.all_constant();
        let pointer_offset = layout.pointer_offset() as u64;

        struct PartitionWriter {
            data_blocks: Vec<RowBlock>,
            heap_blocks: Vec<RowBlock>,
            data_pin: Option<PinnedHandle>,
            heap_pin: Option<PinnedHandle>,
        }

        let mut writers: Vec<PartitionWriter> = (0..num_partitions)
            .map(|_| PartitionWriter {
                data_blocks: Vec::new(),
                heap_blocks: Vec::new(),
                data_pin: None,
                heap_pin: None,
            })
            .collect();

        let source_inner = source.inner();
        let heap_inner = source_heap.inner();
        if !all_constant && source_inner.blocks.len() != heap_inner.blocks.len() {
            return internal_err!(
                "swizzled collection has {} data blocks but {} heap blocks",
                source_inner.blocks.len(),
                heap_inner.blocks.len()
            );
        }

        let data_block_capacity = source.block_capacity();
        let heap_block_capacity = source_heap.block_capacity();

        for (block_idx, block) in source_inner.blocks.iter().enumerate() {
            let data_pin = buffer_manager.pin(&block.block)?;
            let heap_pin = if all_constant {
                None
            } else {
                Some(buffer_manager.pin(&heap_inner.blocks[block_idx].block)?)
            };
            for r in 0..block.count {
                let row = data_pin.ptr() as u64 + (r * row_width) as u64;
                let hash = unsafe { read_u64(row + pointer_offset) };
                let p = Self::partition_index(hash, radix_bits);
                let writer = &mut writers[p];

                // blob of this row in the (swizzled) source heap block
                let (blob_ptr, blob_size) = match (&heap_pin, layout.heap_pointer_offset())
                {
                    (Some(heap_pin), Some(heap_pointer_offset)) => {
                        let offset =
                            unsafe { read_u64(row + heap_pointer_offset as u64) };
                        let blob = heap_pin.ptr() as u64 + offset;
                        let size = unsafe { read_u32(blob) } as usize;
                        (blob, size)
                    }
                    _ => (0, 0),
                };

                // open a fresh block pair when either side is full
                let data_full = match writer.data_blocks.last() {
                    None => true,
                    Some(b) => b.count == b.capacity,
                };
                let heap_full = match writer.heap_blocks.last() {
                    None => !all_constant,
                    Some(b) => b.byte_offset + blob_size > b.capacity,
                };
                if data_full || (!all_constant && heap_full) {
                    let data_block = buffer_manager
                        .register_block(data_block_capacity * row_width)?;
                    writer.data_pin = Some(buffer_manager.pin(&data_block)?);
                    writer.data_blocks.push(RowBlock {
                        block: data_block,
                        capacity: data_block_capacity,
                        count: 0,
                        byte_offset: 0,
                    });
                    if !all_constant {
                        let capacity = heap_block_capacity.max(blob_size);
                        let heap_block = buffer_manager.register_block(capacity)?;
                        writer.heap_pin = Some(buffer_manager.pin(&heap_block)?);
                        writer.heap_blocks.push(RowBlock {
                            block: heap_block,
                            capacity,
                            count: 0,
                            byte_offset: 0,
                        });
                    }
                }

                // copy the row
                let data_pin_out = writer.data_pin.as_ref().unwrap();
                let out_block = writer.data_blocks.last_mut().unwrap();
                let out_row =
                    data_pin_out.ptr() as u64 + (out_block.count * row_width) as u64;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        row as *const u8,
                        out_row as *mut u8,
                        row_width,
                    );
                }
                out_block.count += 1;
                out_block.byte_offset += row_width;

                // copy the blob and point the row at its new block offset
                if let Some(heap_pointer_offset) = layout.heap_pointer_offset() {
                    let heap_pin_out = writer.heap_pin.as_ref().unwrap();
                    let out_heap = writer.heap_blocks.last_mut().unwrap();
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            blob_ptr as *const u8,
                            heap_pin_out.ptr().add(out_heap.byte_offset),
                            blob_size,
                        );
                        write_u64(
                            out_row + heap_pointer_offset as u64,
                            out_heap.byte_offset as u64,
                        );
                    }
                    out_heap.count += 1;
                    out_heap.byte_offset += blob_size;
                }
            }
        }

        let mut block_collections = Vec::with_capacity(num_partitions);
        let mut heap_collections = Vec::with_capacity(num_partitions);
        for writer in writers {
            block_collections.push(RowCollection::from_blocks(
                Arc::clone(&buffer_manager),
                data_block_capacity,
                row_width,
                false,
                writer.data_blocks,
            ));
            heap_collections.push(RowCollection::from_blocks(
                Arc::clone(&buffer_manager),
                heap_block_capacity,
                1,
                false,
                writer.heap_blocks,
            ));
        }
        Ok((block_collections, heap_collections))
    }
}
