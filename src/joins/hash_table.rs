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

//! [`JoinHashTable`]: the vectorized, partitioned hash table of the join.
//!
//! Build-side chunks are scattered into a row collection per worker, the
//! workers' local tables merge into a global one, and `finalize` threads the
//! bucket chains through the stored rows. Probe-side chunks then walk the
//! chains through a [`ScanStructure`].
//!
//! When the build side cannot fit in memory, each local table is swizzled
//! and radix-partitioned into the global table instead, and the global table
//! is finalized one partition window at a time; probe rows of pending
//! partitions are sunk into a residual table and replayed in a later round.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use log::debug;
use parking_lot::Mutex;

use crate::buffer::{BufferManager, PinnedHandle};
use crate::error::Result;
use crate::hash_utils::{combine_hash_column, hash_column, join_random_state};
use crate::internal_err;
use crate::join_type::{JoinCondition, JoinType};
use crate::joins::correlated::CorrelatedMarkInfo;
use crate::joins::hash_index::HashIndex;
use crate::joins::radix::RadixPartitioning;
use crate::joins::scan::ScanStructure;
use crate::joins::{HashTableConfig, JoinHTScanState};
use crate::row::collection::RowCollection;
use crate::row::layout::RowLayout;
use crate::row::ops;
use crate::task::{Event, Task, TaskExecutionMode, TaskExecutionResult};

/// Fraction of the buffer manager's memory target that one partition window
/// may occupy
const PARTITION_MEMORY_FRACTION: f64 = 0.8;

struct Histogram {
    counts: Vec<u64>,
    radix_bits: usize,
}

#[derive(Default)]
struct PartitionCollections {
    blocks: Vec<RowCollection>,
    heaps: Vec<RowCollection>,
}

/// The join hash table
pub struct JoinHashTable {
    buffer_manager: Arc<BufferManager>,
    config: HashTableConfig,
    conditions: Vec<JoinCondition>,
    /// Number of leading hashed-equality conditions
    equality_count: usize,
    build_types: Vec<DataType>,
    layout: RowLayout,
    join_type: JoinType,
    random_state: RandomState,

    /// Live (unswizzled) row data
    block_collection: RowCollection,
    string_heap: RowCollection,
    /// Swizzled row data, safe to evict
    swizzled_block_collection: RowCollection,
    swizzled_string_heap: RowCollection,
    /// Per-partition swizzled data, populated by `partition`
    partitions: Mutex<PartitionCollections>,
    histogram: Mutex<Histogram>,

    correlated_mark: Option<CorrelatedMarkInfo>,
    has_null: AtomicBool,
    finalized: AtomicBool,
    finalize_lock: Mutex<()>,
    hash_index: Mutex<Option<HashIndex>>,
    /// Pins on every build block, held from `finalize` until the table is
    /// destroyed (or the external round ends)
    pinned_handles: Mutex<Vec<PinnedHandle>>,
    /// Partitions below the cutoff are finalized (or in the current round)
    partition_cutoff: AtomicUsize,
}

impl JoinHashTable {
    /// Create a hash table for the given conditions and build payload types.
    /// Equality conditions must prefix the condition list and at least one is
    /// required.
    pub fn try_new(
        buffer_manager: Arc<BufferManager>,
        conditions: Vec<JoinCondition>,
        build_types: Vec<DataType>,
        join_type: JoinType,
        config: HashTableConfig,
    ) -> Result<Self> {
        let equality_count = conditions
            .iter()
            .take_while(|c| c.comparison.is_equality())
            .count();
        if equality_count == 0 {
            return internal_err!("hash join requires at least one equality condition");
        }
        if conditions[equality_count..]
            .iter()
            .any(|c| c.comparison.is_equality())
        {
            return internal_err!("equality conditions must precede the others");
        }

        let mut layout_types: Vec<DataType> =
            conditions.iter().map(|c| c.data_type.clone()).collect();
        layout_types.extend(build_types.iter().cloned());
        let layout = RowLayout::try_new(layout_types, join_type.is_right_outer())?;

        let block_capacity = config
            .vector_size
            .max(config.block_size / layout.row_width() + 1);
        let block_collection = RowCollection::new(
            Arc::clone(&buffer_manager),
            block_capacity,
            layout.row_width(),
            false,
        );
        let string_heap =
            RowCollection::new(Arc::clone(&buffer_manager), config.block_size, 1, true);
        let swizzled_block_collection = block_collection.copy_empty();
        let swizzled_string_heap = string_heap.copy_empty();
        let histogram = Histogram {
            counts: RadixPartitioning::initialize_histogram(config.initial_radix_bits),
            radix_bits: config.initial_radix_bits,
        };

        Ok(Self {
            buffer_manager,
            config,
            conditions,
            equality_count,
            build_types,
            layout,
            join_type,
            random_state: join_random_state(),
            block_collection,
            string_heap,
            swizzled_block_collection,
            swizzled_string_heap,
            partitions: Mutex::new(PartitionCollections::default()),
            histogram: Mutex::new(histogram),
            correlated_mark: None,
            has_null: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            finalize_lock: Mutex::new(()),
            hash_index: Mutex::new(None),
            pinned_handles: Mutex::new(Vec::new()),
            partition_cutoff: AtomicUsize::new(0),
        })
    }

    /// Attach the side aggregate of a correlated MARK join. The correlated
    /// columns prefix the key chunks, followed by the actual key column.
    pub fn with_correlated_mark(mut self, correlated_types: Vec<DataType>) -> Self {
        self.correlated_mark = Some(CorrelatedMarkInfo::new(correlated_types));
        self
    }

    /// An empty table with the same conditions, payload and join type
    pub fn copy_empty(&self) -> Result<Self> {
        Self::try_new(
            Arc::clone(&self.buffer_manager),
            self.conditions.clone(),
            self.build_types.clone(),
            self.join_type,
            self.config.clone(),
        )
    }

    /// An empty table with the same conditions but a different payload; used
    /// for the residual table that collects deferred probe rows
    pub fn copy_empty_with_build_types(&self, build_types: Vec<DataType>) -> Result<Self> {
        Self::try_new(
            Arc::clone(&self.buffer_manager),
            self.conditions.clone(),
            build_types,
            self.join_type,
            self.config.clone(),
        )
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub(crate) fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn conditions(&self) -> &[JoinCondition] {
        &self.conditions
    }

    pub fn build_types(&self) -> &[DataType] {
        &self.build_types
    }

    pub(crate) fn correlated_mark(&self) -> Option<&CorrelatedMarkInfo> {
        self.correlated_mark.as_ref()
    }

    pub fn vector_size(&self) -> usize {
        self.config.vector_size
    }

    /// Rows currently in the live build collection
    pub fn count(&self) -> usize {
        self.block_collection.count()
    }

    /// Bytes of live row and heap data
    pub fn size_in_bytes(&self) -> usize {
        self.block_collection.size_in_bytes() + self.string_heap.size_in_bytes()
    }

    /// Whether any build row was dropped for having a NULL key
    pub fn has_null(&self) -> bool {
        self.has_null.load(Ordering::Relaxed)
    }

    pub fn finalized(&self) -> bool {
        self.finalized.load(Ordering::Relaxed)
    }

    pub fn current_radix_bits(&self) -> usize {
        self.histogram.lock().radix_bits
    }

    /// Snapshot of the histogram counters
    pub fn histogram(&self) -> Vec<u64> {
        self.histogram.lock().counts.clone()
    }

    /// Partitions below this index are finalized or in the current round
    pub fn partition_cutoff(&self) -> usize {
        self.partition_cutoff.load(Ordering::Acquire)
    }

    /// Number of partition slots (zero before `partition` ran)
    pub fn num_partitions(&self) -> usize {
        self.partitions.lock().blocks.len()
    }

    /// Row count per partition slot
    pub fn partition_counts(&self) -> Vec<usize> {
        self.partitions.lock().blocks.iter().map(|b| b.count()).collect()
    }

    fn validate_keys(&self, keys: &RecordBatch) -> Result<()> {
        if keys.num_columns() != self.conditions.len() {
            return internal_err!(
                "key chunk has {} columns but the join has {} conditions",
                keys.num_columns(),
                self.conditions.len()
            );
        }
        for (i, condition) in self.conditions.iter().enumerate() {
            if keys.column(i).data_type() != &condition.data_type {
                return internal_err!(
                    "key column {i} has type {} but the condition expects {}",
                    keys.column(i).data_type(),
                    condition.data_type
                );
            }
        }
        if keys.num_rows() > self.config.vector_size {
            return internal_err!(
                "chunk of {} rows exceeds the vector size {}",
                keys.num_rows(),
                self.config.vector_size
            );
        }
        Ok(())
    }

    /// Filter out rows whose key is NULL on a condition that does not treat
    /// NULLs as equal. Build sides of right/full outer joins keep NULL keys
    /// (they simply never match).
    fn prepare_keys(
        &self,
        key_columns: &[ArrayRef],
        num_rows: usize,
        build_side: bool,
    ) -> Vec<usize> {
        let mut sel: Vec<usize> = (0..num_rows).collect();
        if build_side && self.join_type.is_right_outer() {
            return sel;
        }
        for (i, condition) in self.conditions.iter().enumerate() {
            if condition.comparison.null_equal() {
                continue;
            }
            let column = &key_columns[i];
            if column.null_count() == 0 {
                continue;
            }
            sel.retain(|&idx| !column.is_null(idx));
        }
        sel
    }

    /// Hash the equality key columns for the selected rows. Order-dependent:
    /// the first equality column seeds the hash and the remaining ones are
    /// combined in condition order.
    pub(crate) fn hash_keys(
        &self,
        key_columns: &[ArrayRef],
        sel: &[usize],
        hashes: &mut [u64],
    ) -> Result<()> {
        hash_column(&key_columns[0], sel, hashes, &self.random_state)?;
        for column in key_columns.iter().take(self.equality_count).skip(1) {
            combine_hash_column(column, sel, hashes, &self.random_state)?;
        }
        Ok(())
    }

    /// Append one build-side chunk to this table
    pub fn build(&self, keys: &RecordBatch, payload: &RecordBatch) -> Result<()> {
        if self.finalized() {
            return internal_err!("build on a finalized hash table");
        }
        self.validate_keys(keys)?;
        if keys.num_rows() != payload.num_rows() {
            return internal_err!(
                "keys have {} rows but payload has {}",
                keys.num_rows(),
                payload.num_rows()
            );
        }
        if payload.num_columns() != self.build_types.len() {
            return internal_err!(
                "payload has {} columns but the table stores {}",
                payload.num_columns(),
                self.build_types.len()
            );
        }
        if keys.num_rows() == 0 {
            return Ok(());
        }

        if self.join_type == JoinType::Mark {
            if let Some(info) = &self.correlated_mark {
                let correlated = info.column_count();
                if keys.num_columns() < correlated + 1 {
                    return internal_err!(
                        "correlated MARK join expects {} correlated columns plus a key",
                        correlated
                    );
                }
                info.add_chunk(&keys.columns()[..correlated], keys.column(correlated))?;
            }
        }

        let sel = self.prepare_keys(keys.columns(), keys.num_rows(), true);
        if sel.len() < keys.num_rows() {
            self.has_null.store(true, Ordering::Relaxed);
        }
        if sel.is_empty() {
            return Ok(());
        }

        let mut rows = vec![0u64; sel.len()];
        let handles = self.block_collection.build(sel.len(), &mut rows, None)?;

        let mut hashes = vec![0u64; keys.num_rows()];
        self.hash_keys(keys.columns(), &sel, &mut hashes)?;

        {
            let mut histogram = self.histogram.lock();
            let radix_bits = histogram.radix_bits;
            RadixPartitioning::update_histogram(
                &hashes,
                &sel,
                &mut histogram.counts,
                radix_bits,
            );
        }

        let mut columns: Vec<ArrayRef> = keys.columns().to_vec();
        columns.extend(payload.columns().iter().cloned());
        ops::scatter(&columns, &self.layout, &rows, &self.string_heap, &sel)?;
        if self.join_type.is_right_outer() {
            ops::init_match_flags(&self.layout, &rows);
        }
        ops::scatter_hashes(&self.layout, &rows, &hashes, &sel);
        drop(handles);

        debug!(
            "built {} rows into hash table ({} total)",
            sel.len(),
            self.count()
        );
        Ok(())
    }

    /// Steal `other`'s blocks (and partitions). After the merge `other` is
    /// empty and safe to drop.
    pub fn merge(&self, other: &JoinHashTable) -> Result<()> {
        self.block_collection.merge(&other.block_collection);
        self.swizzled_block_collection
            .merge(&other.swizzled_block_collection);
        if !self.layout.all_constant() {
            self.string_heap.merge(&other.string_heap);
            self.swizzled_string_heap.merge(&other.swizzled_string_heap);
        }
        if other.has_null() {
            self.has_null.store(true, Ordering::Relaxed);
        }

        let mut other_parts = other.partitions.lock();
        if other_parts.blocks.is_empty() {
            return Ok(());
        }
        let mut parts = self.partitions.lock();
        if parts.blocks.is_empty() {
            parts.blocks = std::mem::take(&mut other_parts.blocks);
            parts.heaps = std::mem::take(&mut other_parts.heaps);
        } else {
            if parts.blocks.len() != other_parts.blocks.len() {
                return internal_err!(
                    "cannot merge {} partitions into {}",
                    other_parts.blocks.len(),
                    parts.blocks.len()
                );
            }
            for (target, source) in parts.blocks.iter().zip(&other_parts.blocks) {
                target.merge(source);
            }
            for (target, source) in parts.heaps.iter().zip(&other_parts.heaps) {
                target.merge(source);
            }
            other_parts.blocks.clear();
            other_parts.heaps.clear();
        }
        Ok(())
    }

    /// Add `other`'s histogram counters into this table's, under the
    /// histogram lock. Both tables must be at the same radix bit count.
    pub fn merge_histogram(&self, other: &JoinHashTable) -> Result<()> {
        let mut histogram = self.histogram.lock();
        let other_histogram = other.histogram.lock();
        if histogram.radix_bits != other_histogram.radix_bits {
            return internal_err!(
                "histogram radix bits diverged: {} vs {}",
                histogram.radix_bits,
                other_histogram.radix_bits
            );
        }
        for (count, other_count) in histogram
            .counts
            .iter_mut()
            .zip(&other_histogram.counts)
        {
            *count += other_count;
        }
        Ok(())
    }

    /// Build the bucket array over the live blocks and pin them for the
    /// table's lifetime. Single-threaded; no probes may be in flight.
    pub fn finalize(&self) -> Result<()> {
        if self.finalized() {
            return internal_err!("hash table finalized twice");
        }
        let index =
            HashIndex::new(&self.buffer_manager, self.count(), self.config.block_size)?;
        {
            let inner = self.block_collection.inner();
            let mut pins = self.pinned_handles.lock();
            for block in &inner.blocks {
                let pin = self.buffer_manager.pin(&block.block)?;
                index.insert_rows(&self.layout, pin.ptr() as u64, block.count);
                pins.push(pin);
            }
        }
        *self.hash_index.lock() = Some(index);
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }

    /// Probe this table with one chunk of keys, returning the scan structure
    /// that drives result production
    pub fn probe(&self, keys: &RecordBatch) -> Result<ScanStructure<'_>> {
        self.validate_keys(keys)?;
        let mut structure = ScanStructure::new(self, keys);
        if self.count() == 0 {
            return Ok(structure);
        }
        if !self.finalized() {
            return internal_err!("probe on a hash table that has not been finalized");
        }
        let sel = self.prepare_keys(keys.columns(), keys.num_rows(), false);
        if sel.is_empty() {
            return Ok(structure);
        }
        let mut hashes = vec![0u64; keys.num_rows()];
        self.hash_keys(keys.columns(), &sel, &mut hashes)?;
        let index = self.hash_index.lock();
        let index = index
            .as_ref()
            .expect("finalized table must have a bucket array");
        structure.init_chains(index, &hashes, &sel);
        Ok(structure)
    }

    /// Probe the finalized partition window and sink the probe rows of
    /// pending partitions into `local`, the residual table, for a later
    /// round. Sunk rows are deactivated in the returned scan structure so
    /// each probe row is emitted in exactly one round.
    pub fn probe_and_build(
        &self,
        keys: &RecordBatch,
        payload: &RecordBatch,
        local: &JoinHashTable,
    ) -> Result<ScanStructure<'_>> {
        self.validate_keys(keys)?;
        if keys.num_rows() != payload.num_rows() {
            return internal_err!(
                "keys have {} rows but payload has {}",
                keys.num_rows(),
                payload.num_rows()
            );
        }
        let mut structure = ScanStructure::new(self, keys);
        let sel = self.prepare_keys(keys.columns(), keys.num_rows(), false);
        if sel.is_empty() {
            return Ok(structure);
        }
        let mut hashes = vec![0u64; keys.num_rows()];
        self.hash_keys(keys.columns(), &sel, &mut hashes)?;

        let mut true_sel = Vec::new();
        let mut false_sel = Vec::new();
        RadixPartitioning::select(
            &hashes,
            &sel,
            self.current_radix_bits(),
            self.partition_cutoff(),
            &mut true_sel,
            &mut false_sel,
        );

        if !false_sel.is_empty() {
            let sink_keys = take_batch(keys, &false_sel)?;
            let sink_payload = take_batch(payload, &false_sel)?;
            local.build(&sink_keys, &sink_payload)?;
            structure.deactivate(&false_sel);
        }

        if self.count() > 0 && !true_sel.is_empty() {
            if !self.finalized() {
                return internal_err!(
                    "probe on a hash table that has not been finalized"
                );
            }
            let index = self.hash_index.lock();
            let index = index
                .as_ref()
                .expect("finalized table must have a bucket array");
            structure.init_chains(index, &hashes, &true_sel);
        }
        Ok(structure)
    }

    /// Scan out build rows whose match flag is still false, with the probe
    /// columns set to NULL. `schema` is the full result schema (probe columns
    /// followed by build columns); multiple threads may share `state`.
    pub fn scan_full_outer(
        &self,
        state: &JoinHTScanState,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        if !self.join_type.is_right_outer() {
            return internal_err!(
                "full-outer scan on a {} join",
                self.join_type
            );
        }
        let tuple_size = self.layout.tuple_size();
        let row_width = self.layout.row_width() as u64;
        let mut addresses = Vec::with_capacity(self.config.vector_size);
        {
            let mut position = state.lock();
            let inner = self.block_collection.inner();
            let pins = self.pinned_handles.lock();
            'blocks: while position.block_position < inner.blocks.len() {
                let block = &inner.blocks[position.block_position];
                let base = pins[position.block_position].ptr() as u64;
                while position.position < block.count {
                    let row = base + position.position as u64 * row_width;
                    position.position += 1;
                    if unsafe { !ops::match_flag(row, tuple_size) } {
                        addresses.push(row);
                        if addresses.len() == self.config.vector_size {
                            break 'blocks;
                        }
                    }
                }
                if position.position >= block.count {
                    position.block_position += 1;
                    position.position = 0;
                }
            }
        }

        let probe_columns = schema.fields().len() - self.build_types.len();
        let count = addresses.len();
        let sel: Vec<usize> = (0..count).collect();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for field in schema.fields().iter().take(probe_columns) {
            columns.push(arrow::array::new_null_array(field.data_type(), count));
        }
        for i in 0..self.build_types.len() {
            columns.push(ops::gather_column(
                &self.layout,
                self.conditions.len() + i,
                &addresses,
                &sel,
                None,
                count,
            )?);
        }
        Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
    }

    /// Swizzle this table's collected blocks: every heap pointer in every row
    /// becomes a relative offset, and the heap blocks move to the swizzled
    /// collection so the buffer manager may evict them.
    pub fn swizzle_collected_blocks(&self) -> Result<()> {
        self.swizzled_block_collection.merge(&self.block_collection);
        if self.layout.all_constant() {
            return Ok(());
        }

        let buffer_manager = &self.buffer_manager;
        let heap_pointer_offset = self
            .layout
            .heap_pointer_offset()
            .expect("variable layout has a heap pointer") as u64;
        let row_width = self.layout.row_width() as u64;

        let mut heap_inner = self.string_heap.inner();
        let swizzled_inner = self.swizzled_block_collection.inner();
        let mut new_heap_blocks = Vec::new();
        let mut heap_block_idx = 0;
        let mut heap_block_remaining =
            heap_inner.blocks.first().map(|b| b.count).unwrap_or(0);

        for data_block in swizzled_inner.blocks.iter() {
            if data_block.count == 0 {
                continue;
            }
            if heap_block_remaining == 0 {
                heap_block_idx += 1;
                heap_block_remaining = heap_inner.blocks[heap_block_idx].count;
            }
            let data_pin = buffer_manager.pin(&data_block.block)?;
            let data_base = data_pin.ptr() as u64;
            unsafe { ops::swizzle_columns(&self.layout, data_base, data_block.count) };

            if heap_block_remaining >= data_block.count {
                // the current heap block holds every blob of this data block:
                // share it by reference
                let heap_block = &heap_inner.blocks[heap_block_idx];
                let heap_pin = buffer_manager.pin(&heap_block.block)?;
                let first_blob = unsafe { ops::read_u64(data_base + heap_pointer_offset) };
                let base_offset = first_blob - heap_pin.ptr() as u64;
                unsafe {
                    ops::swizzle_heap_pointers(
                        &self.layout,
                        data_base,
                        data_block.count,
                        first_blob,
                        base_offset,
                    )
                };
                new_heap_blocks.push(crate::row::collection::RowBlock {
                    block: Arc::clone(&heap_block.block),
                    capacity: heap_block.capacity,
                    count: data_block.count,
                    byte_offset: heap_block.byte_offset,
                });
                heap_block_remaining -= data_block.count;
            } else {
                // blobs spread over several heap blocks: coalesce them into a
                // fresh block
                let mut data_block_remaining = data_block.count;
                let mut run_base = data_base;
                let mut parts: Vec<(u64, usize)> = Vec::new();
                let mut total = 0usize;
                while data_block_remaining > 0 {
                    if heap_block_remaining == 0 {
                        heap_block_idx += 1;
                        heap_block_remaining = heap_inner.blocks[heap_block_idx].count;
                    }
                    let next = data_block_remaining.min(heap_block_remaining);
                    unsafe {
                        let heap_start = ops::read_u64(run_base + heap_pointer_offset);
                        let heap_end = ops::read_u64(
                            run_base + (next as u64 - 1) * row_width + heap_pointer_offset,
                        );
                        let size = (heap_end - heap_start) as usize
                            + ops::read_u32(heap_end) as usize;
                        parts.push((heap_start, size));
                        ops::swizzle_heap_pointers(
                            &self.layout,
                            run_base,
                            next,
                            heap_start,
                            total as u64,
                        );
                        total += size;
                    }
                    run_base += next as u64 * row_width;
                    data_block_remaining -= next;
                    heap_block_remaining -= next;
                }
                let capacity = self.string_heap.block_capacity().max(total);
                let block = buffer_manager.register_block(capacity)?;
                let pin = buffer_manager.pin(&block)?;
                let mut dst = pin.ptr();
                for (src, size) in parts {
                    unsafe {
                        std::ptr::copy_nonoverlapping(src as *const u8, dst, size);
                        dst = dst.add(size);
                    }
                }
                new_heap_blocks.push(crate::row::collection::RowBlock {
                    block,
                    capacity,
                    count: data_block.count,
                    byte_offset: total,
                });
            }
        }

        {
            let mut swizzled_heap = self.swizzled_string_heap.inner();
            swizzled_heap.count += heap_inner.count;
            swizzled_heap.blocks.append(&mut new_heap_blocks);
        }
        heap_inner.blocks.clear();
        heap_inner.pinned_blocks.clear();
        heap_inner.count = 0;
        Ok(())
    }

    /// Move the swizzled blocks back into the live collections, rewriting
    /// heap offsets to absolute pointers against the re-pinned heap blocks
    pub fn unswizzle_blocks(&self) -> Result<()> {
        let all_constant = self.layout.all_constant();
        let (blocks, heap_blocks, swizzled_count, swizzled_heap_count) = {
            let mut swizzled = self.swizzled_block_collection.inner();
            let mut swizzled_heap = self.swizzled_string_heap.inner();
            if !all_constant && swizzled.blocks.len() != swizzled_heap.blocks.len() {
                return internal_err!(
                    "swizzled collection has {} data blocks but {} heap blocks",
                    swizzled.blocks.len(),
                    swizzled_heap.blocks.len()
                );
            }
            let count = swizzled.count;
            let heap_count = swizzled_heap.count;
            swizzled.count = 0;
            swizzled_heap.count = 0;
            (
                std::mem::take(&mut swizzled.blocks),
                std::mem::take(&mut swizzled_heap.blocks),
                count,
                heap_count,
            )
        };

        let mut live = self.block_collection.inner();
        let mut live_heap = self.string_heap.inner();
        for (i, data_block) in blocks.into_iter().enumerate() {
            if !all_constant {
                let data_pin = self.buffer_manager.pin(&data_block.block)?;
                let heap_block = &heap_blocks[i];
                let heap_pin = self.buffer_manager.pin(&heap_block.block)?;
                unsafe {
                    ops::unswizzle_pointers(
                        &self.layout,
                        data_pin.ptr() as u64,
                        heap_pin.ptr() as u64,
                        data_block.count,
                    )
                };
                live_heap.pinned_blocks.push(heap_pin);
            }
            live.blocks.push(data_block);
        }
        for heap_block in heap_blocks {
            live_heap.blocks.push(heap_block);
        }
        live.count += swizzled_count;
        live_heap.count += swizzled_heap_count;
        Ok(())
    }

    /// Estimate whether the largest projected partition of `histogram` fits
    /// the buffer manager's memory target
    fn partitions_fit_in_memory(&self, histogram: &[u64], avg_entry_size: usize) -> bool {
        let Some(largest) = histogram.iter().max() else {
            return true;
        };
        let budget =
            (self.buffer_manager.memory_limit() as f64 * PARTITION_MEMORY_FRACTION) as u64;
        largest.saturating_mul(avg_entry_size as u64) <= budget
    }

    /// Reduce the radix bits while the reduced partitions would still fit in
    /// memory, to get as few partitions as possible
    fn reduce_histogram(&self, avg_string_size: usize) -> Result<()> {
        let avg_entry_size = avg_string_size + self.layout.row_width();
        let mut histogram = self.histogram.lock();
        while histogram.radix_bits > 1 {
            let reduced = RadixPartitioning::reduce_histogram(
                &histogram.counts,
                histogram.radix_bits,
                histogram.radix_bits - 1,
            )?;
            if self.partitions_fit_in_memory(&reduced, avg_entry_size) {
                histogram.counts = reduced;
                histogram.radix_bits -= 1;
            } else {
                break;
            }
        }
        debug!("partitioning at {} radix bits", histogram.radix_bits);
        Ok(())
    }

    /// Force the radix bit count to `radix_bits`, reducing the histogram to
    /// match. Radix bits are fixed build-wide before any partitioning; the
    /// probe-side residual table calls this to mirror the build side.
    pub fn force_radix_bits(&self, radix_bits: usize) -> Result<()> {
        let mut histogram = self.histogram.lock();
        if radix_bits > histogram.radix_bits {
            return internal_err!(
                "cannot raise radix bits from {} to {}",
                histogram.radix_bits,
                radix_bits
            );
        }
        let reduced = RadixPartitioning::reduce_histogram(
            &histogram.counts,
            histogram.radix_bits,
            radix_bits,
        )?;
        histogram.counts = reduced;
        histogram.radix_bits = radix_bits;
        Ok(())
    }

    /// Merge the local tables' histograms into the global table's, settle the
    /// radix bit count, and return the event whose tasks partition each local
    /// into the global table
    pub fn schedule_partition_tasks(
        global: &Arc<JoinHashTable>,
        local_tables: Vec<JoinHashTable>,
    ) -> Result<PartitionEvent> {
        let mut total_string_size = 0usize;
        let mut total_count = 0usize;
        for local in &local_tables {
            if local.block_collection.count() != 0 || local.string_heap.count() != 0 {
                return internal_err!("local table must be swizzled before partitioning");
            }
            global.merge_histogram(local)?;
            total_string_size += local.swizzled_string_heap.size_in_bytes();
            total_count += local.swizzled_block_collection.count();
        }
        let avg_string_size = if total_count == 0 {
            0
        } else {
            total_string_size / total_count
        };
        global.reduce_histogram(avg_string_size)?;
        Ok(PartitionEvent {
            global: Arc::clone(global),
            local_tables: Mutex::new(local_tables),
        })
    }

    /// Radix-partition this (local, swizzled) table and merge the partitions
    /// into the global table
    pub fn partition(&self, global: &JoinHashTable) -> Result<()> {
        if self.block_collection.count() != 0 || self.string_heap.count() != 0 {
            return internal_err!("table must be swizzled before partitioning");
        }
        if !self.partitions.lock().blocks.is_empty() {
            return internal_err!("table partitioned twice");
        }
        let radix_bits = global.current_radix_bits();
        let (blocks, heaps) = RadixPartitioning::partition(
            &self.layout,
            &self.swizzled_block_collection,
            &self.swizzled_string_heap,
            radix_bits,
        )?;
        {
            let mut parts = self.partitions.lock();
            parts.blocks = blocks;
            parts.heaps = heaps;
        }
        self.swizzled_block_collection.clear();
        self.swizzled_string_heap.clear();
        global.merge(self)
    }

    /// Move partitions `[from, to)` back into the swizzled collections, ready
    /// to be unswizzled and finalized
    fn pin_partitions(&self, from: usize, to: usize) {
        let parts = self.partitions.lock();
        for p in from..to {
            self.swizzled_block_collection.merge(&parts.blocks[p]);
            if !self.layout.all_constant() {
                self.swizzled_string_heap.merge(&parts.heaps[p]);
            }
        }
    }

    /// Drop the previous round's live data, bucket array and pins
    fn reset_live(&self) {
        self.block_collection.clear();
        self.string_heap.clear();
        self.pinned_handles.lock().clear();
        *self.hash_index.lock() = None;
        self.finalized.store(false, Ordering::Release);
    }

    /// Finalize the next window of partitions: pick the longest prefix of
    /// pending partitions that fits the memory target (at least one), pin and
    /// unswizzle it, and build the bucket array over it
    pub fn finalize_external(&self) -> Result<()> {
        let _guard = self.finalize_lock.lock();
        let from = self.partition_cutoff();
        let to = {
            let parts = self.partitions.lock();
            if parts.blocks.is_empty() {
                return internal_err!("external finalize without partitions");
            }
            if from >= parts.blocks.len() {
                return internal_err!("all partitions have been finalized already");
            }
            let budget = (self.buffer_manager.memory_limit() as f64
                * PARTITION_MEMORY_FRACTION) as usize;
            let mut to = from;
            let mut window_size = 0usize;
            while to < parts.blocks.len() {
                let partition_size = parts.blocks[to].size_in_bytes()
                    + parts.heaps.get(to).map(|h| h.size_in_bytes()).unwrap_or(0);
                if to > from && window_size + partition_size > budget {
                    break;
                }
                window_size += partition_size;
                to += 1;
            }
            to
        };

        self.reset_live();
        self.pin_partitions(from, to);
        self.unswizzle_blocks()?;
        self.finalize()?;
        self.partition_cutoff.store(to, Ordering::Release);
        debug!(
            "finalized external partition window [{from}, {to}) with {} rows",
            self.count()
        );
        Ok(())
    }

    /// Advance this (probe-side) table to the build table's cutoff: discard
    /// the consumed window, pin and unswizzle the new one into the live
    /// collections, and reset the shared scan state for the replay loop
    pub fn prepare_partitioned_probe(
        &self,
        build: &JoinHashTable,
        state: &JoinHTScanState,
    ) -> Result<()> {
        let from = self.partition_cutoff();
        let to = build.partition_cutoff();
        if to < from {
            return internal_err!("build cutoff {to} behind probe cutoff {from}");
        }
        self.reset_live();
        self.pin_partitions(from, to);
        self.unswizzle_blocks()?;
        state.reset();
        self.partition_cutoff.store(to, Ordering::Release);
        Ok(())
    }

    /// Re-materialize up to `vector_size` stored rows as (keys, payload)
    /// chunks for the probe replay loop, advancing the shared cursor
    pub fn scan_probe_chunk(
        &self,
        state: &JoinHTScanState,
    ) -> Result<Option<(RecordBatch, RecordBatch)>> {
        let row_width = self.layout.row_width() as u64;
        let mut addresses = Vec::with_capacity(self.config.vector_size);
        let mut pins: Vec<PinnedHandle> = Vec::new();
        {
            let mut position = state.lock();
            let inner = self.block_collection.inner();
            'blocks: while position.block_position < inner.blocks.len() {
                let block = &inner.blocks[position.block_position];
                let pin = self.buffer_manager.pin(&block.block)?;
                let base = pin.ptr() as u64;
                pins.push(pin);
                while position.position < block.count {
                    addresses.push(base + position.position as u64 * row_width);
                    position.position += 1;
                    if addresses.len() == self.config.vector_size {
                        break 'blocks;
                    }
                }
                if position.position >= block.count {
                    position.block_position += 1;
                    position.position = 0;
                }
            }
        }
        if addresses.is_empty() {
            return Ok(None);
        }

        let count = addresses.len();
        let sel: Vec<usize> = (0..count).collect();
        let key_count = self.conditions.len();
        let mut key_columns = Vec::with_capacity(key_count);
        for col in 0..key_count {
            key_columns.push(ops::gather_column(
                &self.layout,
                col,
                &addresses,
                &sel,
                None,
                count,
            )?);
        }
        let mut payload_columns = Vec::with_capacity(self.build_types.len());
        for i in 0..self.build_types.len() {
            payload_columns.push(ops::gather_column(
                &self.layout,
                key_count + i,
                &addresses,
                &sel,
                None,
                count,
            )?);
        }
        let key_types: Vec<DataType> =
            self.conditions.iter().map(|c| c.data_type.clone()).collect();
        let keys = RecordBatch::try_new(schema_of("k", &key_types), key_columns)?;
        let payload =
            RecordBatch::try_new(schema_of("p", &self.build_types), payload_columns)?;
        Ok(Some((keys, payload)))
    }
}

fn schema_of(prefix: &str, types: &[DataType]) -> SchemaRef {
    Arc::new(Schema::new(
        types
            .iter()
            .enumerate()
            .map(|(i, data_type)| Field::new(format!("{prefix}{i}"), data_type.clone(), true))
            .collect::<Vec<_>>(),
    ))
}

/// Take the rows named by `sel` out of `batch`
pub(crate) fn take_batch(batch: &RecordBatch, sel: &[usize]) -> Result<RecordBatch> {
    let indices = UInt32Array::from(sel.iter().map(|&i| i as u32).collect::<Vec<_>>());
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(sel.len()));
    Ok(RecordBatch::try_new_with_options(
        batch.schema(),
        columns,
        &options,
    )?)
}

/// Event that fans one partition task per local table out to the task
/// runtime and finalizes the first external window once they all completed
pub struct PartitionEvent {
    global: Arc<JoinHashTable>,
    local_tables: Mutex<Vec<JoinHashTable>>,
}

impl Event for PartitionEvent {
    fn schedule(&self) -> Result<Vec<Box<dyn Task>>> {
        let local_tables = std::mem::take(&mut *self.local_tables.lock());
        Ok(local_tables
            .into_iter()
            .map(|local| {
                Box::new(PartitionTask {
                    global: Arc::clone(&self.global),
                    local: Some(local),
                }) as Box<dyn Task>
            })
            .collect())
    }

    fn finish_event(&self) -> Result<()> {
        self.global.finalize_external()
    }
}

/// Partitions one local table into the global table
struct PartitionTask {
    global: Arc<JoinHashTable>,
    local: Option<JoinHashTable>,
}

impl Task for PartitionTask {
    fn execute_task(&mut self, _mode: TaskExecutionMode) -> Result<TaskExecutionResult> {
        let Some(local) = self.local.take() else {
            return internal_err!("partition task executed twice");
        };
        local.partition(&self.global)?;
        Ok(TaskExecutionResult::Finished)
    }
}
