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

//! A vectorized, partitioned hash-join execution kernel over Arrow columnar
//! data.
//!
//! The kernel supports all standard relational join variants (inner, left,
//! right, full outer, semi, anti, mark, single) over [`RecordBatch`] chunks,
//! and can spill the build side to buffer-managed, evictable blocks by radix
//! partitioning it when it exceeds available memory.
//!
//! The flow mirrors a push-based physical plan: build-side chunks go through
//! per-worker [`JoinHashTable`]s that merge into a global table (directly, or
//! via swizzle → partition → merge in external mode), `finalize` builds the
//! bucket array, and probe-side chunks drive [`ScanStructure`]s that emit
//! result chunks.
//!
//! ```
//! use std::sync::Arc;
//! use arrow::array::{ArrayRef, Int32Array, StringArray};
//! use arrow::datatypes::{DataType, Field, Schema};
//! use arrow::record_batch::RecordBatch;
//! use radix_join::buffer::BufferManager;
//! use radix_join::join_type::{JoinCondition, JoinType};
//! use radix_join::joins::{HashTableConfig, JoinHashTable};
//!
//! let ht = JoinHashTable::try_new(
//!     BufferManager::new(),
//!     vec![JoinCondition::equal(DataType::Int32)],
//!     vec![DataType::Utf8],
//!     JoinType::Inner,
//!     HashTableConfig::default(),
//! )
//! .unwrap();
//!
//! let key_schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)]));
//! let keys = RecordBatch::try_new(
//!     Arc::clone(&key_schema),
//!     vec![Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef],
//! )
//! .unwrap();
//! let payload = RecordBatch::try_new(
//!     Arc::new(Schema::new(vec![Field::new("v", DataType::Utf8, true)])),
//!     vec![Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef],
//! )
//! .unwrap();
//! ht.build(&keys, &payload).unwrap();
//! ht.finalize().unwrap();
//!
//! let result_schema = Arc::new(Schema::new(vec![
//!     Field::new("k", DataType::Int32, true),
//!     Field::new("v", DataType::Utf8, true),
//! ]));
//! let mut scan = ht.probe(&keys).unwrap();
//! let result = scan.next(&keys, &result_schema).unwrap();
//! assert_eq!(result.num_rows(), 2);
//! ```
//!
//! [`RecordBatch`]: arrow::record_batch::RecordBatch
//! [`JoinHashTable`]: joins::JoinHashTable
//! [`ScanStructure`]: joins::ScanStructure

pub mod buffer;
pub mod error;
pub mod hash_utils;
pub mod join_type;
pub mod joins;
pub mod row;
pub mod task;

pub use error::{JoinError, Result};
pub use join_type::{Comparison, JoinCondition, JoinType};
pub use joins::{HashTableConfig, JoinHTScanState, JoinHashTable, ScanStructure};
