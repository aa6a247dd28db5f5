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

//! The partitioned hash-join kernel

use parking_lot::{Mutex, MutexGuard};

pub mod correlated;
pub mod hash_index;
pub mod hash_table;
pub mod radix;
pub mod scan;

pub use hash_table::{JoinHashTable, PartitionEvent};
pub use scan::ScanStructure;

/// Configuration recognized by the join kernel
#[derive(Debug, Clone)]
pub struct HashTableConfig {
    /// Maximum rows per chunk emitted or consumed
    pub vector_size: usize,
    /// Row/heap block byte capacity
    pub block_size: usize,
    /// Starting radix bits for the histogram and partitioning
    pub initial_radix_bits: usize,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            vector_size: 2048,
            block_size: 256 * 1024,
            initial_radix_bits: radix::INITIAL_RADIX_BITS,
        }
    }
}

pub(crate) struct ScanPosition {
    pub block_position: usize,
    pub position: usize,
}

/// Shared cursor over `(block_position, position)` used by the full-outer
/// build-side scan and the partitioned probe replay. Multiple threads may
/// consume it concurrently; each call takes up to `vector_size` rows under
/// the lock.
pub struct JoinHTScanState {
    position: Mutex<ScanPosition>,
}

impl JoinHTScanState {
    pub fn new() -> Self {
        Self {
            position: Mutex::new(ScanPosition {
                block_position: 0,
                position: 0,
            }),
        }
    }

    /// Rewind the cursor for a new round
    pub fn reset(&self) {
        let mut pos = self.position.lock();
        pos.block_position = 0;
        pos.position = 0;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ScanPosition> {
        self.position.lock()
    }
}

impl Default for JoinHTScanState {
    fn default() -> Self {
        Self::new()
    }
}
