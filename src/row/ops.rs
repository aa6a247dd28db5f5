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

//! Row operations: scatter columns into reserved row slots, gather columns
//! back out, evaluate the predicate set against a pointer frontier, and
//! rewrite heap pointers between their swizzled and unswizzled forms.
//!
//! Rows are addressed by raw `u64` addresses into pinned blocks. Callers are
//! responsible for keeping the pins alive for the duration of a call; every
//! address handed to these functions must come from a reservation made by
//! [`RowCollection::build`] against a block that is still pinned.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::DataType;

use crate::buffer::PinnedHandle;
use crate::error::Result;
use crate::internal_err;
use crate::join_type::{Comparison, JoinCondition};
use crate::row::collection::RowCollection;
use crate::row::layout::{RowLayout, HEAP_BLOB_HEADER};

#[inline]
pub(crate) unsafe fn read_u32(ptr: u64) -> u32 {
    (ptr as *const u32).read_unaligned()
}

#[inline]
pub(crate) unsafe fn write_u32(ptr: u64, value: u32) {
    (ptr as *mut u32).write_unaligned(value)
}

#[inline]
pub(crate) unsafe fn read_u64(ptr: u64) -> u64 {
    (ptr as *const u64).read_unaligned()
}

#[inline]
pub(crate) unsafe fn write_u64(ptr: u64, value: u64) {
    (ptr as *mut u64).write_unaligned(value)
}

#[inline]
unsafe fn row_is_valid(row: u64, col: usize) -> bool {
    let byte = *((row + (col / 8) as u64) as *const u8);
    byte & (1 << (col % 8)) != 0
}

#[inline]
unsafe fn set_row_invalid(row: u64, col: usize) {
    let ptr = (row + (col / 8) as u64) as *mut u8;
    *ptr &= !(1 << (col % 8));
}

/// Monotonically set the match flag of a build row. Concurrent probes may
/// race on this; every writer stores the same value, so relaxed atomics are
/// enough.
#[inline]
pub(crate) unsafe fn set_match_flag(row: u64, tuple_size: usize) {
    let flag = AtomicU8::from_ptr((row + tuple_size as u64) as *mut u8);
    flag.store(1, AtomicOrdering::Relaxed);
}

#[inline]
pub(crate) unsafe fn match_flag(row: u64, tuple_size: usize) -> bool {
    *((row + tuple_size as u64) as *const u8) != 0
}

/// Write the stored hash of each reserved row
pub fn scatter_hashes(layout: &RowLayout, rows: &[u64], hashes: &[u64], sel: &[usize]) {
    let offset = layout.hash_offset() as u64;
    for (i, &idx) in sel.iter().enumerate() {
        unsafe { write_u64(rows[i] + offset, hashes[idx]) };
    }
}

/// Initialize the match flag of each reserved row to "not matched"
pub fn init_match_flags(layout: &RowLayout, rows: &[u64]) {
    let offset = layout
        .match_offset()
        .expect("layout has no match flag") as u64;
    for &row in rows {
        unsafe { *((row + offset) as *mut u8) = 0 };
    }
}

macro_rules! scatter_fixed {
    ($ARRAY_TYPE:ty, $NATIVE:ty, $array:ident, $rows:ident, $sel:ident, $offset:ident, $col:ident, $get:expr) => {{
        let array = $array.as_any().downcast_ref::<$ARRAY_TYPE>().unwrap();
        for (i, &idx) in $sel.iter().enumerate() {
            if array.is_null(idx) {
                unsafe { set_row_invalid($rows[i], $col) };
            } else {
                let value: $NATIVE = ($get)(array, idx);
                unsafe {
                    (($rows[i] + $offset) as *mut $NATIVE).write_unaligned(value)
                };
            }
        }
    }};
}

macro_rules! scatter_var {
    ($ARRAY_TYPE:ty, $array:ident, $rows:ident, $sel:ident, $offset:ident, $col:ident, $cursors:ident) => {{
        let array = $array.as_any().downcast_ref::<$ARRAY_TYPE>().unwrap();
        for (i, &idx) in $sel.iter().enumerate() {
            if array.is_null(idx) {
                unsafe { set_row_invalid($rows[i], $col) };
            } else {
                let bytes: &[u8] = array.value(idx).as_ref();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        $cursors[i] as *mut u8,
                        bytes.len(),
                    );
                    write_u32($rows[i] + $offset, bytes.len() as u32);
                    write_u64($rows[i] + $offset + 4, $cursors[i]);
                }
                $cursors[i] += bytes.len() as u64;
            }
        }
    }};
}

fn var_len(array: &ArrayRef, idx: usize) -> usize {
    match array.data_type() {
        DataType::Utf8 => {
            let a = array.as_any().downcast_ref::<StringArray>().unwrap();
            if a.is_null(idx) {
                0
            } else {
                a.value(idx).len()
            }
        }
        DataType::Binary => {
            let a = array.as_any().downcast_ref::<BinaryArray>().unwrap();
            if a.is_null(idx) {
                0
            } else {
                a.value(idx).len()
            }
        }
        _ => 0,
    }
}

/// Scatter `columns` into the reserved row slots `rows` (one per selected
/// input row). Heap bytes for variable-length values are reserved from
/// `heap`; the resulting in-row pointers are absolute, i.e. the rows come out
/// unswizzled.
pub fn scatter(
    columns: &[ArrayRef],
    layout: &RowLayout,
    rows: &[u64],
    heap: &RowCollection,
    sel: &[usize],
) -> Result<()> {
    let count = sel.len();
    debug_assert_eq!(rows.len(), count);
    debug_assert_eq!(columns.len(), layout.column_count());

    // all columns start out valid
    for &row in rows {
        unsafe { std::ptr::write_bytes(row as *mut u8, 0xFF, layout.null_width()) };
    }

    // reserve one heap blob per row and write the blob headers
    let mut cursors: Vec<u64> = Vec::new();
    let mut _heap_handles: Vec<PinnedHandle> = Vec::new();
    if let Some(heap_pointer_offset) = layout.heap_pointer_offset() {
        let mut entry_sizes = vec![HEAP_BLOB_HEADER; count];
        for (col, data_type) in layout.types().iter().enumerate() {
            if matches!(data_type, DataType::Utf8 | DataType::Binary) {
                for (i, &idx) in sel.iter().enumerate() {
                    entry_sizes[i] += var_len(&columns[col], idx);
                }
            }
        }
        let mut blobs = vec![0u64; count];
        _heap_handles = heap.build(count, &mut blobs, Some(&entry_sizes))?;
        for i in 0..count {
            unsafe {
                write_u32(blobs[i], entry_sizes[i] as u32);
                write_u64(rows[i] + heap_pointer_offset as u64, blobs[i]);
            }
        }
        cursors = blobs
            .iter()
            .map(|&b| b + HEAP_BLOB_HEADER as u64)
            .collect();
    }

    for (col, array) in columns.iter().enumerate() {
        let offset = layout.offset(col) as u64;
        match array.data_type() {
            DataType::Boolean => {
                scatter_fixed!(BooleanArray, u8, array, rows, sel, offset, col, |a: &BooleanArray,
                    i| a.value(i) as u8)
            }
            DataType::Int8 => {
                scatter_fixed!(Int8Array, i8, array, rows, sel, offset, col, |a: &Int8Array, i| a
                    .value(i))
            }
            DataType::Int16 => {
                scatter_fixed!(Int16Array, i16, array, rows, sel, offset, col, |a: &Int16Array,
                    i| a.value(i))
            }
            DataType::Int32 => {
                scatter_fixed!(Int32Array, i32, array, rows, sel, offset, col, |a: &Int32Array,
                    i| a.value(i))
            }
            DataType::Int64 => {
                scatter_fixed!(Int64Array, i64, array, rows, sel, offset, col, |a: &Int64Array,
                    i| a.value(i))
            }
            DataType::UInt8 => {
                scatter_fixed!(UInt8Array, u8, array, rows, sel, offset, col, |a: &UInt8Array,
                    i| a.value(i))
            }
            DataType::UInt16 => {
                scatter_fixed!(UInt16Array, u16, array, rows, sel, offset, col, |a: &UInt16Array,
                    i| a.value(i))
            }
            DataType::UInt32 => {
                scatter_fixed!(UInt32Array, u32, array, rows, sel, offset, col, |a: &UInt32Array,
                    i| a.value(i))
            }
            DataType::UInt64 => {
                scatter_fixed!(UInt64Array, u64, array, rows, sel, offset, col, |a: &UInt64Array,
                    i| a.value(i))
            }
            DataType::Float32 => {
                scatter_fixed!(Float32Array, f32, array, rows, sel, offset, col, |a: &Float32Array,
                    i| a.value(i))
            }
            DataType::Float64 => {
                scatter_fixed!(Float64Array, f64, array, rows, sel, offset, col, |a: &Float64Array,
                    i| a.value(i))
            }
            DataType::Date32 => {
                scatter_fixed!(Date32Array, i32, array, rows, sel, offset, col, |a: &Date32Array,
                    i| a.value(i))
            }
            DataType::Date64 => {
                scatter_fixed!(Date64Array, i64, array, rows, sel, offset, col, |a: &Date64Array,
                    i| a.value(i))
            }
            DataType::Utf8 => {
                scatter_var!(StringArray, array, rows, sel, offset, col, cursors)
            }
            DataType::Binary => {
                scatter_var!(BinaryArray, array, rows, sel, offset, col, cursors)
            }
            other => return internal_err!("Unsupported scatter type: {other}"),
        }
    }
    Ok(())
}

macro_rules! gather_fixed {
    ($NATIVE:ty, $pointers:ident, $ptr_sel:ident, $positions:ident, $out_len:ident, $offset:ident, $col:ident, $build:expr) => {{
        let mut values: Vec<Option<$NATIVE>> = vec![None; $out_len];
        for (i, &sel_idx) in $ptr_sel.iter().enumerate() {
            let row = $pointers[sel_idx];
            let out = match $positions {
                Some(p) => p[i],
                None => i,
            };
            unsafe {
                if row_is_valid(row, $col) {
                    values[out] =
                        Some((((row + $offset) as *const $NATIVE).read_unaligned()));
                }
            }
        }
        ($build)(values)
    }};
}

/// Materialize column `col` from the rows addressed by
/// `pointers[ptr_sel[i]]`. The i-th gathered value lands at output position
/// `positions[i]` (or `i` when `positions` is `None`); untouched positions
/// are NULL. The output has `out_len` rows.
pub fn gather_column(
    layout: &RowLayout,
    col: usize,
    pointers: &[u64],
    ptr_sel: &[usize],
    positions: Option<&[usize]>,
    out_len: usize,
) -> Result<ArrayRef> {
    use std::sync::Arc;
    let offset = layout.offset(col) as u64;
    let array: ArrayRef = match &layout.types()[col] {
        DataType::Boolean => {
            gather_fixed!(u8, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<u8>,
            >| {
                Arc::new(BooleanArray::from_iter(
                    v.into_iter().map(|o| o.map(|b| b != 0)),
                )) as ArrayRef
            })
        }
        DataType::Int8 => {
            gather_fixed!(i8, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<i8>,
            >| Arc::new(Int8Array::from_iter(v)) as ArrayRef)
        }
        DataType::Int16 => {
            gather_fixed!(i16, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<i16>,
            >| Arc::new(Int16Array::from_iter(v)) as ArrayRef)
        }
        DataType::Int32 => {
            gather_fixed!(i32, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<i32>,
            >| Arc::new(Int32Array::from_iter(v)) as ArrayRef)
        }
        DataType::Int64 => {
            gather_fixed!(i64, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<i64>,
            >| Arc::new(Int64Array::from_iter(v)) as ArrayRef)
        }
        DataType::UInt8 => {
            gather_fixed!(u8, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<u8>,
            >| Arc::new(UInt8Array::from_iter(v)) as ArrayRef)
        }
        DataType::UInt16 => {
            gather_fixed!(u16, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<u16>,
            >| Arc::new(UInt16Array::from_iter(v)) as ArrayRef)
        }
        DataType::UInt32 => {
            gather_fixed!(u32, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<u32>,
            >| Arc::new(UInt32Array::from_iter(v)) as ArrayRef)
        }
        DataType::UInt64 => {
            gather_fixed!(u64, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<u64>,
            >| Arc::new(UInt64Array::from_iter(v)) as ArrayRef)
        }
        DataType::Float32 => {
            gather_fixed!(f32, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<f32>,
            >| Arc::new(Float32Array::from_iter(v)) as ArrayRef)
        }
        DataType::Float64 => {
            gather_fixed!(f64, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<f64>,
            >| Arc::new(Float64Array::from_iter(v)) as ArrayRef)
        }
        DataType::Date32 => {
            gather_fixed!(i32, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<i32>,
            >| Arc::new(Date32Array::from_iter(v)) as ArrayRef)
        }
        DataType::Date64 => {
            gather_fixed!(i64, pointers, ptr_sel, positions, out_len, offset, col, |v: Vec<
                Option<i64>,
            >| Arc::new(Date64Array::from_iter(v)) as ArrayRef)
        }
        DataType::Utf8 => {
            let mut values: Vec<Option<String>> = vec![None; out_len];
            for (i, &sel_idx) in ptr_sel.iter().enumerate() {
                let row = pointers[sel_idx];
                let out = positions.map_or(i, |p| p[i]);
                unsafe {
                    if row_is_valid(row, col) {
                        let len = read_u32(row + offset) as usize;
                        let ptr = read_u64(row + offset + 4);
                        let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
                        values[out] =
                            Some(std::str::from_utf8_unchecked(bytes).to_string());
                    }
                }
            }
            Arc::new(StringArray::from_iter(values))
        }
        DataType::Binary => {
            let mut values: Vec<Option<Vec<u8>>> = vec![None; out_len];
            for (i, &sel_idx) in ptr_sel.iter().enumerate() {
                let row = pointers[sel_idx];
                let out = positions.map_or(i, |p| p[i]);
                unsafe {
                    if row_is_valid(row, col) {
                        let len = read_u32(row + offset) as usize;
                        let ptr = read_u64(row + offset + 4);
                        values[out] = Some(
                            std::slice::from_raw_parts(ptr as *const u8, len).to_vec(),
                        );
                    }
                }
            }
            Arc::new(BinaryArray::from_iter(values))
        }
        other => return internal_err!("Unsupported gather type: {other}"),
    };
    Ok(array)
}

fn compare_values<V: PartialOrd>(
    left: Option<V>,
    right: Option<V>,
    comparison: Comparison,
) -> bool {
    let not_distinct = match (&left, &right) {
        (None, None) => true,
        (Some(l), Some(r)) => l == r,
        _ => false,
    };
    match comparison {
        Comparison::Equal => matches!((&left, &right), (Some(_), Some(_))) && not_distinct,
        Comparison::NotDistinctFrom => not_distinct,
        Comparison::DistinctFrom => !not_distinct,
        Comparison::NotEqual => match (&left, &right) {
            (Some(l), Some(r)) => l != r,
            _ => false,
        },
        Comparison::LessThan
        | Comparison::LessThanOrEqual
        | Comparison::GreaterThan
        | Comparison::GreaterThanOrEqual => match (left, right) {
            (Some(l), Some(r)) => match l.partial_cmp(&r) {
                Some(Ordering::Less) => matches!(
                    comparison,
                    Comparison::LessThan | Comparison::LessThanOrEqual
                ),
                Some(Ordering::Equal) => matches!(
                    comparison,
                    Comparison::LessThanOrEqual | Comparison::GreaterThanOrEqual
                ),
                Some(Ordering::Greater) => matches!(
                    comparison,
                    Comparison::GreaterThan | Comparison::GreaterThanOrEqual
                ),
                None => false,
            },
            _ => false,
        },
    }
}

macro_rules! compare_cell_fixed {
    ($ARRAY_TYPE:ty, $NATIVE:ty, $array:ident, $idx:ident, $row:ident, $offset:ident, $col:ident, $comparison:ident, $get:expr) => {{
        let array = $array.as_any().downcast_ref::<$ARRAY_TYPE>().unwrap();
        let left: Option<$NATIVE> = if array.is_null($idx) {
            None
        } else {
            Some(($get)(array, $idx))
        };
        let right: Option<$NATIVE> = unsafe {
            if row_is_valid($row, $col) {
                Some((($row + $offset) as *const $NATIVE).read_unaligned())
            } else {
                None
            }
        };
        compare_values(left, right, $comparison)
    }};
}

fn compare_cell(
    array: &ArrayRef,
    idx: usize,
    row: u64,
    layout: &RowLayout,
    col: usize,
    comparison: Comparison,
) -> bool {
    let offset = layout.offset(col) as u64;
    match &layout.types()[col] {
        DataType::Boolean => {
            compare_cell_fixed!(BooleanArray, u8, array, idx, row, offset, col, comparison, |a: &BooleanArray,
                i| a.value(i) as u8)
        }
        DataType::Int8 => {
            compare_cell_fixed!(Int8Array, i8, array, idx, row, offset, col, comparison, |a: &Int8Array,
                i| a.value(i))
        }
        DataType::Int16 => {
            compare_cell_fixed!(Int16Array, i16, array, idx, row, offset, col, comparison, |a: &Int16Array,
                i| a.value(i))
        }
        DataType::Int32 => {
            compare_cell_fixed!(Int32Array, i32, array, idx, row, offset, col, comparison, |a: &Int32Array,
                i| a.value(i))
        }
        DataType::Int64 => {
            compare_cell_fixed!(Int64Array, i64, array, idx, row, offset, col, comparison, |a: &Int64Array,
                i| a.value(i))
        }
        DataType::UInt8 => {
            compare_cell_fixed!(UInt8Array, u8, array, idx, row, offset, col, comparison, |a: &UInt8Array,
                i| a.value(i))
        }
        DataType::UInt16 => {
            compare_cell_fixed!(UInt16Array, u16, array, idx, row, offset, col, comparison, |a: &UInt16Array,
                i| a.value(i))
        }
        DataType::UInt32 => {
            compare_cell_fixed!(UInt32Array, u32, array, idx, row, offset, col, comparison, |a: &UInt32Array,
                i| a.value(i))
        }
        DataType::UInt64 => {
            compare_cell_fixed!(UInt64Array, u64, array, idx, row, offset, col, comparison, |a: &UInt64Array,
                i| a.value(i))
        }
        DataType::Float32 => {
            compare_cell_fixed!(Float32Array, f32, array, idx, row, offset, col, comparison, |a: &Float32Array,
                i| a.value(i))
        }
        DataType::Float64 => {
            compare_cell_fixed!(Float64Array, f64, array, idx, row, offset, col, comparison, |a: &Float64Array,
                i| a.value(i))
        }
        DataType::Date32 => {
            compare_cell_fixed!(Date32Array, i32, array, idx, row, offset, col, comparison, |a: &Date32Array,
                i| a.value(i))
        }
        DataType::Date64 => {
            compare_cell_fixed!(Date64Array, i64, array, idx, row, offset, col, comparison, |a: &Date64Array,
                i| a.value(i))
        }
        DataType::Utf8 | DataType::Binary => {
            let left: Option<&[u8]> = match &layout.types()[col] {
                DataType::Utf8 => {
                    let a = array.as_any().downcast_ref::<StringArray>().unwrap();
                    if a.is_null(idx) {
                        None
                    } else {
                        Some(a.value(idx).as_bytes())
                    }
                }
                _ => {
                    let a = array.as_any().downcast_ref::<BinaryArray>().unwrap();
                    if a.is_null(idx) {
                        None
                    } else {
                        Some(a.value(idx))
                    }
                }
            };
            let right: Option<&[u8]> = unsafe {
                if row_is_valid(row, col) {
                    let len = read_u32(row + offset) as usize;
                    let ptr = read_u64(row + offset + 4);
                    Some(std::slice::from_raw_parts(ptr as *const u8, len))
                } else {
                    None
                }
            };
            compare_values(left, right, comparison)
        }
        _ => false,
    }
}

/// Evaluate the full predicate set against the current pointer frontier.
///
/// `sel` enters with the candidate probe rows and leaves with the rows whose
/// row pointer satisfied every condition; rows that failed are appended to
/// `no_match` when provided. Returns the number of matches.
pub fn match_rows(
    keys: &[ArrayRef],
    layout: &RowLayout,
    pointers: &[u64],
    conditions: &[JoinCondition],
    sel: &mut Vec<usize>,
    mut no_match: Option<&mut Vec<usize>>,
) -> usize {
    for (col, condition) in conditions.iter().enumerate() {
        if sel.is_empty() {
            break;
        }
        let array = &keys[col];
        let mut kept = Vec::with_capacity(sel.len());
        for &idx in sel.iter() {
            let row = pointers[idx];
            if compare_cell(array, idx, row, layout, col, condition.comparison) {
                kept.push(idx);
            } else if let Some(no_match) = no_match.as_deref_mut() {
                no_match.push(idx);
            }
        }
        *sel = kept;
    }
    sel.len()
}

/// Rewrite every variable-length cell of `count` rows starting at `base`
/// from an absolute address to an offset relative to the row's heap blob
pub unsafe fn swizzle_columns(layout: &RowLayout, base: u64, count: usize) {
    let Some(heap_pointer_offset) = layout.heap_pointer_offset() else {
        return;
    };
    let var_cols: Vec<usize> = layout
        .types()
        .iter()
        .enumerate()
        .filter(|(_, t)| matches!(t, DataType::Utf8 | DataType::Binary))
        .map(|(i, _)| i)
        .collect();
    for r in 0..count {
        let row = base + (r * layout.row_width()) as u64;
        let blob = read_u64(row + heap_pointer_offset as u64);
        for &col in &var_cols {
            if row_is_valid(row, col) {
                let cell = row + layout.offset(col) as u64 + 4;
                write_u64(cell, read_u64(cell) - blob);
            }
        }
    }
}

/// Rewrite the heap pointer of `count` rows starting at `base` from the
/// absolute blob address to `base_offset` plus the blob's distance from
/// `heap_start`
pub unsafe fn swizzle_heap_pointers(
    layout: &RowLayout,
    base: u64,
    count: usize,
    heap_start: u64,
    base_offset: u64,
) {
    let heap_pointer_offset = layout
        .heap_pointer_offset()
        .expect("all-constant layout has no heap pointers") as u64;
    for r in 0..count {
        let row = base + (r * layout.row_width()) as u64;
        let blob = read_u64(row + heap_pointer_offset);
        write_u64(row + heap_pointer_offset, base_offset + (blob - heap_start));
    }
}

/// Rewrite `count` rows starting at `base` back to absolute addresses, using
/// `heap_base` as the base address of the rows' (pinned) heap block
pub unsafe fn unswizzle_pointers(layout: &RowLayout, base: u64, heap_base: u64, count: usize) {
    let Some(heap_pointer_offset) = layout.heap_pointer_offset() else {
        return;
    };
    let var_cols: Vec<usize> = layout
        .types()
        .iter()
        .enumerate()
        .filter(|(_, t)| matches!(t, DataType::Utf8 | DataType::Binary))
        .map(|(i, _)| i)
        .collect();
    for r in 0..count {
        let row = base + (r * layout.row_width()) as u64;
        let blob_offset = read_u64(row + heap_pointer_offset as u64);
        let blob = heap_base + blob_offset;
        write_u64(row + heap_pointer_offset as u64, blob);
        for &col in &var_cols {
            if row_is_valid(row, col) {
                let cell = row + layout.offset(col) as u64 + 4;
                write_u64(cell, blob + read_u64(cell));
            }
        }
    }
}
