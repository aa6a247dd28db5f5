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

//! The partitioned (external) build and probe-replay path

mod common;

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use common::{batch, drive, schema, sorted_rows};
use radix_join::buffer::BufferManager;
use radix_join::join_type::{JoinCondition, JoinType};
use radix_join::joins::{HashTableConfig, JoinHTScanState, JoinHashTable};
use radix_join::task::run_event;

fn key_batch(keys: &[i64]) -> RecordBatch {
    batch(vec![(
        "k",
        Arc::new(Int64Array::from(keys.to_vec())) as ArrayRef,
    )])
}

fn value_batch(name: &str, prefix: &str, keys: &[i64]) -> RecordBatch {
    batch(vec![(
        name,
        Arc::new(StringArray::from(
            keys.iter().map(|k| format!("{prefix}{k}")).collect::<Vec<_>>(),
        )) as ArrayRef,
    )])
}

fn combine(keys: &RecordBatch, payload: &RecordBatch) -> RecordBatch {
    let mut columns = keys.columns().to_vec();
    columns.extend(payload.columns().iter().cloned());
    RecordBatch::try_new(
        schema(vec![("k", DataType::Int64), ("pv", DataType::Utf8)]),
        columns,
    )
    .unwrap()
}

#[test]
fn swizzled_table_survives_eviction() {
    let bm = BufferManager::new();
    let config = HashTableConfig {
        vector_size: 128,
        block_size: 4 * 1024,
        initial_radix_bits: 2,
    };
    let ht = JoinHashTable::try_new(
        Arc::clone(&bm),
        vec![JoinCondition::equal(DataType::Int64)],
        vec![DataType::Utf8],
        JoinType::Inner,
        config,
    )
    .unwrap();

    let keys: Vec<i64> = (0..500).collect();
    for chunk in keys.chunks(125) {
        ht.build(&key_batch(chunk), &value_batch("v", "value_", chunk))
            .unwrap();
    }

    // swizzle, page everything out, and reload through unswizzle
    ht.swizzle_collected_blocks().unwrap();
    let resident_before = bm.used();
    bm.evict_unpinned();
    assert!(bm.used() < resident_before);
    ht.unswizzle_blocks().unwrap();
    ht.finalize().unwrap();

    let probe_keys: Vec<i64> = vec![0, 123, 499, 1000];
    let probe = key_batch(&probe_keys);
    let out_schema = schema(vec![("k", DataType::Int64), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(
        sorted_rows(&results),
        vec![
            vec!["0".to_string(), "value_0".to_string()],
            vec!["123".to_string(), "value_123".to_string()],
            vec!["499".to_string(), "value_499".to_string()],
        ]
    );
}

#[test]
fn partitioning_is_a_covering_partition() {
    let bm = BufferManager::new();
    let config = HashTableConfig {
        vector_size: 256,
        block_size: 4 * 1024,
        initial_radix_bits: 3,
    };
    let global = Arc::new(
        JoinHashTable::try_new(
            Arc::clone(&bm),
            vec![JoinCondition::equal(DataType::Int64)],
            vec![DataType::Utf8],
            JoinType::Inner,
            config,
        )
        .unwrap(),
    );
    let local = global.copy_empty().unwrap();
    let keys: Vec<i64> = (0..1000).collect();
    for chunk in keys.chunks(250) {
        local
            .build(&key_batch(chunk), &value_batch("v", "x", chunk))
            .unwrap();
    }
    local.swizzle_collected_blocks().unwrap();
    local.partition(&global).unwrap();

    // every row lands in exactly one of the 2^3 partitions
    assert_eq!(local.num_partitions(), 0);
    assert_eq!(global.num_partitions(), 8);
    assert_eq!(global.partition_counts().iter().sum::<usize>(), 1000);
}

/// Drive a full external join: parallel local builds, swizzle, partition
/// event, then per-round probe replay through the residual table. Returns
/// (result rows, rounds).
fn run_external_join(
    join_type: JoinType,
    config: &HashTableConfig,
    memory_limit: usize,
    build_keys: &[i64],
    probe_keys: &[i64],
    workers: usize,
) -> (Vec<Vec<String>>, usize) {
    let bm = BufferManager::with_memory_limit(memory_limit);
    let conditions = vec![JoinCondition::equal(DataType::Int64)];
    let global = Arc::new(
        JoinHashTable::try_new(
            Arc::clone(&bm),
            conditions,
            vec![DataType::Utf8],
            join_type,
            config.clone(),
        )
        .unwrap(),
    );

    // parallel local builds, one worker per slice
    let slice_len = build_keys.len().div_ceil(workers);
    let locals: Vec<JoinHashTable> = std::thread::scope(|scope| {
        let handles: Vec<_> = build_keys
            .chunks(slice_len)
            .map(|slice| {
                let global = Arc::clone(&global);
                let vector_size = config.vector_size;
                scope.spawn(move || {
                    let local = global.copy_empty().unwrap();
                    for chunk in slice.chunks(vector_size) {
                        local
                            .build(&key_batch(chunk), &value_batch("bv", "b", chunk))
                            .unwrap();
                    }
                    local.swizzle_collected_blocks().unwrap();
                    local
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let event = JoinHashTable::schedule_partition_tasks(&global, locals).unwrap();
    run_event(&event).unwrap();
    assert!(global.finalized());
    let num_partitions = global.num_partitions();
    assert_eq!(num_partitions, 1 << global.current_radix_bits());

    let probe_global = global
        .copy_empty_with_build_types(vec![DataType::Utf8])
        .unwrap();
    let out_schema = schema(vec![
        ("k", DataType::Int64),
        ("pv", DataType::Utf8),
        ("bv", DataType::Utf8),
    ]);

    let mut results = Vec::new();
    let mut rounds = 1;

    // round 1: stream the original probe chunks, sinking pending rows
    let mut residual = global
        .copy_empty_with_build_types(vec![DataType::Utf8])
        .unwrap();
    for chunk in probe_keys.chunks(config.vector_size) {
        let keys = key_batch(chunk);
        let payload = value_batch("pv", "p", chunk);
        let left = combine(&keys, &payload);
        let mut scan = global.probe_and_build(&keys, &payload, &residual).unwrap();
        results.extend(drive(&mut scan, &left, &out_schema));
    }

    // later rounds: replay the residual against the next partition windows
    let state = JoinHTScanState::new();
    while global.partition_cutoff() < num_partitions {
        residual.swizzle_collected_blocks().unwrap();
        probe_global
            .force_radix_bits(global.current_radix_bits())
            .unwrap();
        residual.partition(&probe_global).unwrap();

        // pending partitions are evictable between rounds
        bm.evict_unpinned();

        global.finalize_external().unwrap();
        probe_global
            .prepare_partitioned_probe(&global, &state)
            .unwrap();
        rounds += 1;

        residual = global
            .copy_empty_with_build_types(vec![DataType::Utf8])
            .unwrap();
        while let Some((keys, payload)) = probe_global.scan_probe_chunk(&state).unwrap() {
            let left = combine(&keys, &payload);
            let mut scan = global.probe_and_build(&keys, &payload, &residual).unwrap();
            results.extend(drive(&mut scan, &left, &out_schema));
        }
    }
    // the final round owns every remaining partition, nothing is left over
    assert_eq!(residual.count(), 0);

    (sorted_rows(&results), rounds)
}

/// The single-pass in-memory reference for the same inputs
fn run_reference_join(
    join_type: JoinType,
    config: &HashTableConfig,
    build_keys: &[i64],
    probe_keys: &[i64],
) -> Vec<Vec<String>> {
    let ht = JoinHashTable::try_new(
        BufferManager::new(),
        vec![JoinCondition::equal(DataType::Int64)],
        vec![DataType::Utf8],
        join_type,
        config.clone(),
    )
    .unwrap();
    for chunk in build_keys.chunks(config.vector_size) {
        ht.build(&key_batch(chunk), &value_batch("bv", "b", chunk))
            .unwrap();
    }
    ht.finalize().unwrap();

    let out_schema = schema(vec![
        ("k", DataType::Int64),
        ("pv", DataType::Utf8),
        ("bv", DataType::Utf8),
    ]);
    let mut results = Vec::new();
    for chunk in probe_keys.chunks(config.vector_size) {
        let keys = key_batch(chunk);
        let payload = value_batch("pv", "p", chunk);
        let left = combine(&keys, &payload);
        let mut scan = ht.probe(&keys).unwrap();
        results.extend(drive(&mut scan, &left, &out_schema));
    }
    sorted_rows(&results)
}

#[test]
fn external_inner_join_matches_in_memory_reference() {
    let config = HashTableConfig {
        vector_size: 1024,
        block_size: 16 * 1024,
        initial_radix_bits: 2,
    };
    let mut rng = StdRng::seed_from_u64(7);
    let mut build_keys: Vec<i64> = (0..8000).collect();
    build_keys.shuffle(&mut rng);
    let mut probe_keys: Vec<i64> = (0..10_000).collect();
    probe_keys.shuffle(&mut rng);

    let (external, rounds) = run_external_join(
        JoinType::Inner,
        &config,
        200_000,
        &build_keys,
        &probe_keys,
        2,
    );
    assert!(rounds >= 2, "expected multiple rounds, got {rounds}");
    assert_eq!(external.len(), 8000);

    let reference = run_reference_join(JoinType::Inner, &config, &build_keys, &probe_keys);
    assert_eq!(external, reference);
}

#[test]
fn external_left_join_emits_each_probe_row_once() {
    let config = HashTableConfig {
        vector_size: 256,
        block_size: 4 * 1024,
        initial_radix_bits: 2,
    };
    let build_keys: Vec<i64> = (0..200).collect();
    let probe_keys: Vec<i64> = (0..300).collect();

    let (external, rounds) = run_external_join(
        JoinType::Left,
        &config,
        8_000,
        &build_keys,
        &probe_keys,
        2,
    );
    assert!(rounds >= 2, "expected multiple rounds, got {rounds}");
    // every probe row exactly once: 200 matches + 100 NULL tails
    assert_eq!(external.len(), 300);

    let reference = run_reference_join(JoinType::Left, &config, &build_keys, &probe_keys);
    assert_eq!(external, reference);
}
