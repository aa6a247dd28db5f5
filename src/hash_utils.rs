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

//! Functionality used to hash join-key columns, selection-vector aware.
//!
//! Build and probe sides must use the exact same hash function and seeds, so
//! the seeds are fixed. NULL keys hash to a fixed constant: conditions that
//! treat NULLs as equal (`IS NOT DISTINCT FROM`) need NULL probe keys to land
//! in the same bucket as NULL build keys.

use std::hash::BuildHasher;

use ahash::RandomState;
use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::DataType;

use crate::error::Result;
use crate::internal_err;

/// Hash of a NULL key. Arbitrary but fixed; NULL keys on both sides must
/// collide.
const NULL_HASH: u64 = 0x9e37_79b9_7f4a_7c15;

/// `RandomState` shared by build and probe sides. Fixed seeds so hashes built
/// by one worker match hashes probed by another.
pub fn join_random_state() -> RandomState {
    RandomState::with_seeds(
        0x517c_c1b7_2722_0a95,
        0x3a8b_7c9d_1e2f_4056,
        0x27d4_eb2f_1656_67c5,
        0x9e37_79b9_7f4a_7c15,
    )
}

/// Combines two hashes into one hash
#[inline]
fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

#[inline]
fn normalize_f64(v: f64) -> u64 {
    if v == 0.0 {
        // +0.0 and -0.0 compare equal and must hash equal
        0.0f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

macro_rules! hash_array {
    ($ARRAY_TYPE:ident, $column:ident, $sel:ident, $hashes:ident, $random_state:ident, $combine:ident, $value_hash:expr) => {{
        let array = $column.as_any().downcast_ref::<$ARRAY_TYPE>().unwrap();
        for &idx in $sel {
            let hash = if array.is_null(idx) {
                NULL_HASH
            } else {
                let value = array.value(idx);
                ($value_hash)(value, $random_state)
            };
            $hashes[idx] = if $combine {
                combine_hashes(hash, $hashes[idx])
            } else {
                hash
            };
        }
    }};
}

fn hash_array_dispatch(
    column: &ArrayRef,
    sel: &[usize],
    hashes: &mut [u64],
    random_state: &RandomState,
    combine: bool,
) -> Result<()> {
    match column.data_type() {
        DataType::Boolean => {
            hash_array!(BooleanArray, column, sel, hashes, random_state, combine, |v: bool,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Int8 => {
            hash_array!(Int8Array, column, sel, hashes, random_state, combine, |v: i8,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Int16 => {
            hash_array!(Int16Array, column, sel, hashes, random_state, combine, |v: i16,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Int32 => {
            hash_array!(Int32Array, column, sel, hashes, random_state, combine, |v: i32,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Int64 => {
            hash_array!(Int64Array, column, sel, hashes, random_state, combine, |v: i64,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::UInt8 => {
            hash_array!(UInt8Array, column, sel, hashes, random_state, combine, |v: u8,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::UInt16 => {
            hash_array!(UInt16Array, column, sel, hashes, random_state, combine, |v: u16,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::UInt32 => {
            hash_array!(UInt32Array, column, sel, hashes, random_state, combine, |v: u32,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::UInt64 => {
            hash_array!(UInt64Array, column, sel, hashes, random_state, combine, |v: u64,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Float32 => {
            hash_array!(Float32Array, column, sel, hashes, random_state, combine, |v: f32,
                rs: &RandomState| rs.hash_one(normalize_f64(v as f64)))
        }
        DataType::Float64 => {
            hash_array!(Float64Array, column, sel, hashes, random_state, combine, |v: f64,
                rs: &RandomState| rs.hash_one(normalize_f64(v)))
        }
        DataType::Date32 => {
            hash_array!(Date32Array, column, sel, hashes, random_state, combine, |v: i32,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Date64 => {
            hash_array!(Date64Array, column, sel, hashes, random_state, combine, |v: i64,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Utf8 => {
            hash_array!(StringArray, column, sel, hashes, random_state, combine, |v: &str,
                rs: &RandomState| rs.hash_one(v))
        }
        DataType::Binary => {
            hash_array!(BinaryArray, column, sel, hashes, random_state, combine, |v: &[u8],
                rs: &RandomState| rs.hash_one(v))
        }
        other => {
            return internal_err!("Unsupported data type in hasher: {other}");
        }
    }
    Ok(())
}

/// Hash `column` into `hashes` at the positions named by `sel`
pub fn hash_column(
    column: &ArrayRef,
    sel: &[usize],
    hashes: &mut [u64],
    random_state: &RandomState,
) -> Result<()> {
    hash_array_dispatch(column, sel, hashes, random_state, false)
}

/// Combine `column`'s hash into the running `hashes` at the positions named
/// by `sel`. Order-dependent: both sides must combine key columns in the same
/// order.
pub fn combine_hash_column(
    column: &ArrayRef,
    sel: &[usize],
    hashes: &mut [u64],
    random_state: &RandomState,
) -> Result<()> {
    hash_array_dispatch(column, sel, hashes, random_state, true)
}
