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

//! End-to-end join-variant cases against the in-memory hash table

mod common;

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Int32Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{batch, drive, empty_payload, row, schema, sorted_rows};
use radix_join::buffer::BufferManager;
use radix_join::join_type::{Comparison, JoinCondition, JoinType};
use radix_join::joins::{HashTableConfig, JoinHTScanState, JoinHashTable};

fn hash_table(
    conditions: Vec<JoinCondition>,
    build_types: Vec<DataType>,
    join_type: JoinType,
) -> JoinHashTable {
    JoinHashTable::try_new(
        BufferManager::new(),
        conditions,
        build_types,
        join_type,
        HashTableConfig::default(),
    )
    .unwrap()
}

fn int_keys(values: Vec<Option<i32>>) -> RecordBatch {
    batch(vec![("k", Arc::new(Int32Array::from(values)) as ArrayRef)])
}

#[test]
fn inner_join_basic() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Inner,
    );
    let keys = int_keys(vec![Some(1), Some(2), Some(2)]);
    let payload = batch(vec![(
        "v",
        Arc::new(StringArray::from(vec!["a", "b", "c"])) as ArrayRef,
    )]);
    ht.build(&keys, &payload).unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(1), Some(2), Some(3)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);

    assert_eq!(
        sorted_rows(&results),
        vec![row(&["1", "a"]), row(&["2", "b"]), row(&["2", "c"])]
    );
}

#[test]
fn left_join_emits_null_tail() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Left,
    );
    ht.build(
        &int_keys(vec![Some(1)]),
        &batch(vec![("v", Arc::new(StringArray::from(vec!["a"])) as ArrayRef)]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(1), Some(2)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);

    assert_eq!(
        sorted_rows(&results),
        vec![row(&["1", "a"]), row(&["2", "NULL"])]
    );
}

#[test]
fn left_join_keeps_null_key_rows() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Left,
    );
    ht.build(
        &int_keys(vec![Some(1)]),
        &batch(vec![("v", Arc::new(StringArray::from(vec!["a"])) as ArrayRef)]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(1), None]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);

    assert_eq!(
        sorted_rows(&results),
        vec![row(&["1", "a"]), row(&["NULL", "NULL"])]
    );
}

#[test]
fn semi_and_anti_partition_the_probe_side() {
    let build_keys = int_keys(vec![Some(1), Some(1), Some(2)]);
    let probe = int_keys(vec![Some(1), Some(2), Some(3)]);
    let out_schema = schema(vec![("k", DataType::Int32)]);

    let semi = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![],
        JoinType::Semi,
    );
    semi.build(&build_keys, &empty_payload(3)).unwrap();
    semi.finalize().unwrap();
    let mut scan = semi.probe(&probe).unwrap();
    let semi_rows = sorted_rows(&drive(&mut scan, &probe, &out_schema));
    assert_eq!(semi_rows, vec![row(&["1"]), row(&["2"])]);

    let anti = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![],
        JoinType::Anti,
    );
    anti.build(&build_keys, &empty_payload(3)).unwrap();
    anti.finalize().unwrap();
    let mut scan = anti.probe(&probe).unwrap();
    let anti_rows = sorted_rows(&drive(&mut scan, &probe, &out_schema));
    assert_eq!(anti_rows, vec![row(&["3"])]);
}

#[test]
fn semi_union_anti_is_the_probe_side() {
    let mut rng = StdRng::seed_from_u64(42);
    let build_values: Vec<Option<i32>> =
        (0..200).map(|_| Some(rng.gen_range(0..50))).collect();
    let probe_values: Vec<Option<i32>> =
        (0..100).map(|_| Some(rng.gen_range(0..100))).collect();
    let build_keys = int_keys(build_values);
    let probe = int_keys(probe_values);
    let out_schema = schema(vec![("k", DataType::Int32)]);

    let mut all_rows = Vec::new();
    for join_type in [JoinType::Semi, JoinType::Anti] {
        let ht = hash_table(
            vec![JoinCondition::equal(DataType::Int32)],
            vec![],
            join_type,
        );
        ht.build(&build_keys, &empty_payload(200)).unwrap();
        ht.finalize().unwrap();
        let mut scan = ht.probe(&probe).unwrap();
        all_rows.extend(drive(&mut scan, &probe, &out_schema));
    }
    assert_eq!(sorted_rows(&all_rows), sorted_rows(&[probe]));
}

#[test]
fn mark_join_null_semantics() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![],
        JoinType::Mark,
    );
    // the NULL build key is filtered out but flips has_null
    ht.build(&int_keys(vec![Some(1), None]), &empty_payload(2))
        .unwrap();
    ht.finalize().unwrap();
    assert!(ht.has_null());
    assert_eq!(ht.count(), 1);

    let probe = int_keys(vec![Some(1), Some(2), Some(3)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("mark", DataType::Boolean)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);

    // 1 is found; 2 and 3 are "not found, but the build side has NULLs"
    assert_eq!(
        sorted_rows(&results),
        vec![
            row(&["1", "true"]),
            row(&["2", "NULL"]),
            row(&["3", "NULL"])
        ]
    );
}

#[test]
fn mark_join_null_probe_key_is_null() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![],
        JoinType::Mark,
    );
    ht.build(&int_keys(vec![Some(1)]), &empty_payload(1)).unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![None, Some(1)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("mark", DataType::Boolean)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(
        sorted_rows(&results),
        vec![row(&["1", "true"]), row(&["NULL", "NULL"])]
    );
}

#[test]
fn full_outer_join_emits_both_tails() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Outer,
    );
    ht.build(
        &int_keys(vec![Some(1), Some(2)]),
        &batch(vec![(
            "v",
            Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef,
        )]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(2), Some(3)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let mut results = drive(&mut scan, &probe, &out_schema);

    // probe-side output: the match and the left tail
    assert_eq!(
        sorted_rows(&results),
        vec![row(&["2", "b"]), row(&["3", "NULL"])]
    );

    // build-side tail: unmatched build rows with NULL probe columns
    let state = JoinHTScanState::new();
    loop {
        let tail = ht.scan_full_outer(&state, &out_schema).unwrap();
        if tail.num_rows() == 0 {
            break;
        }
        results.push(tail);
    }
    assert_eq!(
        sorted_rows(&results),
        vec![
            row(&["2", "b"]),
            row(&["3", "NULL"]),
            row(&["NULL", "a"])
        ]
    );
}

#[test]
fn right_join_marks_matches_for_the_tail() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Right,
    );
    ht.build(
        &int_keys(vec![Some(1), Some(2)]),
        &batch(vec![(
            "v",
            Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef,
        )]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(2)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(sorted_rows(&results), vec![row(&["2", "b"])]);

    let state = JoinHTScanState::new();
    let tail = ht.scan_full_outer(&state, &out_schema).unwrap();
    assert_eq!(sorted_rows(&[tail]), vec![row(&["NULL", "a"])]);
}

#[test]
fn single_join_returns_one_row_per_probe_row() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Single,
    );
    ht.build(
        &int_keys(vec![Some(1), Some(1)]),
        &batch(vec![(
            "v",
            Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef,
        )]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(1), Some(2)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.num_rows(), 2);
    let values = result
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    // exactly one of the duplicate build rows is picked for key 1
    assert!(values.value(0) == "a" || values.value(0) == "b");
    assert!(values.is_null(1));
}

#[test]
fn empty_build_side_boundaries() {
    let probe = int_keys(vec![Some(1), Some(2)]);
    let left_schema = schema(vec![("k", DataType::Int32)]);
    let joined_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mark_schema = schema(vec![("k", DataType::Int32), ("mark", DataType::Boolean)]);

    // inner: nothing
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Inner,
    );
    ht.finalize().unwrap();
    let mut scan = ht.probe(&probe).unwrap();
    assert!(drive(&mut scan, &probe, &joined_schema).is_empty());

    // left: every probe row with NULL build columns
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Left,
    );
    ht.finalize().unwrap();
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &joined_schema);
    assert_eq!(
        sorted_rows(&results),
        vec![row(&["1", "NULL"]), row(&["2", "NULL"])]
    );

    // anti: every probe row
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![],
        JoinType::Anti,
    );
    ht.finalize().unwrap();
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &left_schema);
    assert_eq!(sorted_rows(&results), vec![row(&["1"]), row(&["2"])]);

    // mark: a firm false for every probe row
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![],
        JoinType::Mark,
    );
    ht.finalize().unwrap();
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &mark_schema);
    assert_eq!(
        sorted_rows(&results),
        vec![row(&["1", "false"]), row(&["2", "false"])]
    );
}

#[test]
fn empty_probe_side_then_full_outer_scan() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Outer,
    );
    ht.build(
        &int_keys(vec![Some(1)]),
        &batch(vec![("v", Arc::new(StringArray::from(vec!["a"])) as ArrayRef)]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    assert!(drive(&mut scan, &probe, &out_schema).is_empty());

    let state = JoinHTScanState::new();
    let tail = ht.scan_full_outer(&state, &out_schema).unwrap();
    assert_eq!(sorted_rows(&[tail]), vec![row(&["NULL", "a"])]);
    // the cursor is exhausted
    assert_eq!(ht.scan_full_outer(&state, &out_schema).unwrap().num_rows(), 0);
}

#[test]
fn single_bucket_collision_chain_terminates() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Int64],
        JoinType::Inner,
    );
    let n = 100;
    ht.build(
        &int_keys(vec![Some(7); n]),
        &batch(vec![(
            "v",
            Arc::new(Int64Array::from((0..n as i64).collect::<Vec<_>>())) as ArrayRef,
        )]),
    )
    .unwrap();
    ht.finalize().unwrap();

    let probe = int_keys(vec![Some(7), Some(8)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Int64)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);

    let rows = sorted_rows(&results);
    assert_eq!(rows.len(), n);
    let expected: Vec<Vec<String>> = {
        let mut e: Vec<Vec<String>> = (0..n as i64)
            .map(|v| vec!["7".to_string(), v.to_string()])
            .collect();
        e.sort();
        e
    };
    assert_eq!(rows, expected);
}

#[test]
fn not_distinct_from_matches_null_keys() {
    let ht = JoinHashTable::try_new(
        BufferManager::new(),
        vec![JoinCondition::new(
            DataType::Int32,
            Comparison::NotDistinctFrom,
        )],
        vec![DataType::Utf8],
        JoinType::Inner,
        HashTableConfig::default(),
    )
    .unwrap();
    ht.build(
        &int_keys(vec![None, Some(1)]),
        &batch(vec![(
            "v",
            Arc::new(StringArray::from(vec!["n", "one"])) as ArrayRef,
        )]),
    )
    .unwrap();
    ht.finalize().unwrap();
    // NULL keys are kept when the condition treats NULLs as equal
    assert_eq!(ht.count(), 2);
    assert!(!ht.has_null());

    let probe = int_keys(vec![None, Some(2)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Utf8)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(sorted_rows(&results), vec![row(&["NULL", "n"])]);
}

#[test]
fn residual_less_than_predicate_filters_chains() {
    let ht = JoinHashTable::try_new(
        BufferManager::new(),
        vec![
            JoinCondition::equal(DataType::Int32),
            JoinCondition::new(DataType::Int32, Comparison::LessThan),
        ],
        vec![],
        JoinType::Inner,
        HashTableConfig::default(),
    )
    .unwrap();
    let build_keys = batch(vec![
        ("k", Arc::new(Int32Array::from(vec![1, 1])) as ArrayRef),
        ("y", Arc::new(Int32Array::from(vec![10, 5])) as ArrayRef),
    ]);
    ht.build(&build_keys, &empty_payload(2)).unwrap();
    ht.finalize().unwrap();

    // probe x = 7 must only match the build row with y = 10
    let probe = batch(vec![
        ("k", Arc::new(Int32Array::from(vec![1])) as ArrayRef),
        ("x", Arc::new(Int32Array::from(vec![7])) as ArrayRef),
    ]);
    let out_schema = schema(vec![("k", DataType::Int32), ("x", DataType::Int32)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(sorted_rows(&results), vec![row(&["1", "7"])]);
}

#[test]
fn distinct_from_is_a_residual_predicate() {
    let ht = JoinHashTable::try_new(
        BufferManager::new(),
        vec![
            JoinCondition::equal(DataType::Int32),
            JoinCondition::new(DataType::Int32, Comparison::DistinctFrom),
        ],
        vec![],
        JoinType::Inner,
        HashTableConfig::default(),
    )
    .unwrap();
    let build_keys = batch(vec![
        ("k", Arc::new(Int32Array::from(vec![1])) as ArrayRef),
        ("y", Arc::new(Int32Array::from(vec![None as Option<i32>])) as ArrayRef),
    ]);
    ht.build(&build_keys, &empty_payload(1)).unwrap();
    ht.finalize().unwrap();

    // 5 IS DISTINCT FROM NULL: match; NULL IS DISTINCT FROM NULL: no match
    let probe = batch(vec![
        ("k", Arc::new(Int32Array::from(vec![Some(1), Some(1)])) as ArrayRef),
        ("x", Arc::new(Int32Array::from(vec![Some(5), None])) as ArrayRef),
    ]);
    let out_schema = schema(vec![("k", DataType::Int32), ("x", DataType::Int32)]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(sorted_rows(&results), vec![row(&["1", "5"])]);
}

#[test]
fn correlated_mark_join_consults_group_counts() {
    let ht = JoinHashTable::try_new(
        BufferManager::new(),
        vec![
            JoinCondition::equal(DataType::Int32),
            JoinCondition::equal(DataType::Int32),
        ],
        vec![],
        JoinType::Mark,
        HashTableConfig::default(),
    )
    .unwrap()
    .with_correlated_mark(vec![DataType::Int32]);

    // groups: 10 has one NULL key of two rows, 20 is complete
    let build_keys = batch(vec![
        ("corr", Arc::new(Int32Array::from(vec![10, 10, 20])) as ArrayRef),
        (
            "key",
            Arc::new(Int32Array::from(vec![Some(1), None, Some(2)])) as ArrayRef,
        ),
    ]);
    ht.build(&build_keys, &empty_payload(3)).unwrap();
    ht.finalize().unwrap();

    let probe = batch(vec![
        (
            "corr",
            Arc::new(Int32Array::from(vec![10, 20, 30, 10])) as ArrayRef,
        ),
        (
            "key",
            Arc::new(Int32Array::from(vec![Some(5), Some(2), Some(3), None])) as ArrayRef,
        ),
    ]);
    let out_schema = schema(vec![
        ("corr", DataType::Int32),
        ("key", DataType::Int32),
        ("mark", DataType::Boolean),
    ]);
    let mut scan = ht.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(results.len(), 1);
    let marks = results[0]
        .column(2)
        .as_any()
        .downcast_ref::<BooleanArray>()
        .unwrap();
    // (10, 5): no match and the group has a NULL key -> unknown
    assert!(marks.is_null(0));
    // (20, 2): found
    assert!(marks.value(1));
    // (30, 3): the group is empty -> firm false
    assert!(!marks.is_null(2));
    assert!(!marks.value(2));
    // (10, NULL): NULL key -> unknown
    assert!(marks.is_null(3));
}

#[test]
fn merged_locals_probe_like_a_single_table() {
    let bm = BufferManager::new();
    let config = HashTableConfig::default();
    let conditions = vec![JoinCondition::equal(DataType::Int32)];
    let global = JoinHashTable::try_new(
        Arc::clone(&bm),
        conditions.clone(),
        vec![DataType::Int64],
        JoinType::Inner,
        config.clone(),
    )
    .unwrap();

    for worker in 0..2 {
        let local = global.copy_empty().unwrap();
        let keys: Vec<Option<i32>> = (0..100).map(|i| Some(worker * 100 + i)).collect();
        let values: Vec<i64> = (0..100).map(|i| (worker * 100 + i) as i64 * 10).collect();
        local
            .build(
                &int_keys(keys),
                &batch(vec![("v", Arc::new(Int64Array::from(values)) as ArrayRef)]),
            )
            .unwrap();
        global.merge(&local).unwrap();
        assert_eq!(local.count(), 0);
    }
    assert_eq!(global.count(), 200);
    global.finalize().unwrap();

    let probe = int_keys(vec![Some(5), Some(150), Some(400)]);
    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Int64)]);
    let mut scan = global.probe(&probe).unwrap();
    let results = drive(&mut scan, &probe, &out_schema);
    assert_eq!(
        sorted_rows(&results),
        vec![row(&["150", "1500"]), row(&["5", "50"])]
    );
}

#[test]
fn concurrent_probes_and_shared_outer_scan() {
    let ht = Arc::new({
        let ht = hash_table(
            vec![JoinCondition::equal(DataType::Int32)],
            vec![DataType::Int64],
            JoinType::Right,
        );
        let keys: Vec<Option<i32>> = (0..1000).map(Some).collect();
        let values: Vec<i64> = (0..1000).collect();
        ht.build(
            &int_keys(keys),
            &batch(vec![("v", Arc::new(Int64Array::from(values)) as ArrayRef)]),
        )
        .unwrap();
        ht.finalize().unwrap();
        ht
    });

    let out_schema = schema(vec![("k", DataType::Int32), ("v", DataType::Int64)]);
    // four threads probe disjoint ranges of the matched half concurrently
    let matched: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ht = Arc::clone(&ht);
                let out_schema = Arc::clone(&out_schema);
                scope.spawn(move || {
                    let lo = t * 125;
                    let probe = int_keys((lo..lo + 125).map(|i| Some(i as i32)).collect());
                    let mut scan = ht.probe(&probe).unwrap();
                    drive(&mut scan, &probe, &out_schema)
                        .iter()
                        .map(|b| b.num_rows())
                        .sum::<usize>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(matched, 500);

    // two threads drain the shared full-outer cursor
    let state = JoinHTScanState::new();
    let unmatched: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ht = Arc::clone(&ht);
                let out_schema = Arc::clone(&out_schema);
                let state = &state;
                scope.spawn(move || {
                    let mut total = 0;
                    loop {
                        let tail = ht.scan_full_outer(state, &out_schema).unwrap();
                        if tail.num_rows() == 0 {
                            return total;
                        }
                        total += tail.num_rows();
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(unmatched, 500);
}

#[test]
fn build_rejects_malformed_chunks() {
    let ht = hash_table(
        vec![JoinCondition::equal(DataType::Int32)],
        vec![DataType::Utf8],
        JoinType::Inner,
    );
    // cardinality mismatch between keys and payload
    let err = ht.build(
        &int_keys(vec![Some(1), Some(2)]),
        &batch(vec![("v", Arc::new(StringArray::from(vec!["a"])) as ArrayRef)]),
    );
    assert!(err.is_err());

    // wrong key type
    let bad_keys = batch(vec![(
        "k",
        Arc::new(Int64Array::from(vec![1i64])) as ArrayRef,
    )]);
    assert!(ht
        .build(
            &bad_keys,
            &batch(vec![("v", Arc::new(StringArray::from(vec!["a"])) as ArrayRef)]),
        )
        .is_err());
}

#[test]
fn conditions_require_a_leading_equality() {
    let err = JoinHashTable::try_new(
        BufferManager::new(),
        vec![JoinCondition::new(DataType::Int32, Comparison::LessThan)],
        vec![],
        JoinType::Inner,
        HashTableConfig::default(),
    );
    assert!(err.is_err());

    let err = JoinHashTable::try_new(
        BufferManager::new(),
        vec![
            JoinCondition::new(DataType::Int32, Comparison::LessThan),
            JoinCondition::equal(DataType::Int32),
        ],
        vec![],
        JoinType::Inner,
        HashTableConfig::default(),
    );
    assert!(err.is_err());
}
