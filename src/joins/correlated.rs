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

//! Side aggregate for correlated MARK joins.
//!
//! A correlated MARK join needs `COUNT(*)` and `COUNT(key)` per correlated
//! group to distinguish "false" from "unknown": if a group saw rows but some
//! key values were NULL, a non-match must come out as NULL; if the group saw
//! no rows at all, the result is a firm false.

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::DataType;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::internal_err;

/// An owned, hashable value of one correlated column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupValue {
    Null,
    Boolean(bool),
    Int(i64),
    UInt(u64),
    FloatBits(u64),
    Utf8(String),
    Binary(Vec<u8>),
}

fn group_value(array: &ArrayRef, idx: usize) -> Result<GroupValue> {
    if array.is_null(idx) {
        return Ok(GroupValue::Null);
    }
    macro_rules! value {
        ($ARRAY_TYPE:ty, $variant:ident, $convert:expr) => {{
            let array = array.as_any().downcast_ref::<$ARRAY_TYPE>().unwrap();
            Ok(GroupValue::$variant(($convert)(array.value(idx))))
        }};
    }
    match array.data_type() {
        DataType::Boolean => value!(BooleanArray, Boolean, |v| v),
        DataType::Int8 => value!(Int8Array, Int, |v| v as i64),
        DataType::Int16 => value!(Int16Array, Int, |v| v as i64),
        DataType::Int32 => value!(Int32Array, Int, |v| v as i64),
        DataType::Int64 => value!(Int64Array, Int, |v| v),
        DataType::UInt8 => value!(UInt8Array, UInt, |v| v as u64),
        DataType::UInt16 => value!(UInt16Array, UInt, |v| v as u64),
        DataType::UInt32 => value!(UInt32Array, UInt, |v| v as u64),
        DataType::UInt64 => value!(UInt64Array, UInt, |v| v),
        DataType::Float32 => {
            value!(Float32Array, FloatBits, |v: f32| (v as f64).to_bits())
        }
        DataType::Float64 => value!(Float64Array, FloatBits, |v: f64| v.to_bits()),
        DataType::Date32 => value!(Date32Array, Int, |v| v as i64),
        DataType::Date64 => value!(Date64Array, Int, |v| v),
        DataType::Utf8 => value!(StringArray, Utf8, |v: &str| v.to_string()),
        DataType::Binary => value!(BinaryArray, Binary, |v: &[u8]| v.to_vec()),
        other => internal_err!("Unsupported correlated column type: {other}"),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupCounts {
    count_star: i64,
    count: i64,
}

/// Auxiliary aggregate hash table tracking `COUNT(*)` and `COUNT(key)` per
/// correlated group, updated under a dedicated lock during the build
pub struct CorrelatedMarkInfo {
    correlated_types: Vec<DataType>,
    counts: Mutex<HashMap<Vec<GroupValue>, GroupCounts>>,
}

impl CorrelatedMarkInfo {
    pub fn new(correlated_types: Vec<DataType>) -> Self {
        Self {
            correlated_types,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Number of correlated columns, which prefix the MARK join's key chunk
    pub fn column_count(&self) -> usize {
        self.correlated_types.len()
    }

    pub fn correlated_types(&self) -> &[DataType] {
        &self.correlated_types
    }

    /// Account one build chunk: `groups` are the correlated columns,
    /// `payload` the actual key column
    pub fn add_chunk(&self, groups: &[ArrayRef], payload: &ArrayRef) -> Result<()> {
        debug_assert_eq!(groups.len(), self.correlated_types.len());
        let mut counts = self.counts.lock();
        for idx in 0..payload.len() {
            let key = groups
                .iter()
                .map(|g| group_value(g, idx))
                .collect::<Result<Vec<_>>>()?;
            let entry = counts.entry(key).or_default();
            entry.count_star += 1;
            if !payload.is_null(idx) {
                entry.count += 1;
            }
        }
        Ok(())
    }

    /// Fetch `(COUNT(*), COUNT(key))` for each probe row's group; groups that
    /// never appeared on the build side count as `(0, 0)`
    pub fn fetch_aggregates(
        &self,
        groups: &[ArrayRef],
        num_rows: usize,
    ) -> Result<(Vec<i64>, Vec<i64>)> {
        let counts = self.counts.lock();
        let mut count_star = Vec::with_capacity(num_rows);
        let mut count = Vec::with_capacity(num_rows);
        for idx in 0..num_rows {
            let key = groups
                .iter()
                .map(|g| group_value(g, idx))
                .collect::<Result<Vec<_>>>()?;
            let entry = counts.get(&key).copied().unwrap_or_default();
            count_star.push(entry.count_star);
            count.push(entry.count);
        }
        Ok((count_star, count))
    }
}
