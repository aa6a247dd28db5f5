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

//! [`RowLayout`] describes the byte layout of a build-side tuple.
//!
//! ```text
//! ┌─────────────┬──────────────┬─────────────────┬────────────┬──────────┐
//! │  null bits  │ heap pointer │  column cells   │ match byte │ hash u64 │
//! │ ⌈n/8⌉ bytes │ u64, only if │ fixed width or  │ only right │  becomes │
//! │             │ var-len cols │ (len,ptr) pairs │ /full outer│ the next │
//! │             │              │                 │            │  pointer │
//! └─────────────┴──────────────┴─────────────────┴────────────┴──────────┘
//! ```
//!
//! Variable-length cells are 12 bytes: a `u32` length followed by a `u64`
//! pointer. While the row is *unswizzled* the pointer is an absolute address
//! into a pinned heap block; while *swizzled* it is an offset relative to the
//! start of the row's heap blob, and the heap pointer field holds the blob's
//! offset within its heap block instead of an address.
//!
//! After the bucket array is built, the hash field doubles as the chain's
//! next pointer: the hash has served its purpose by then and the slot is
//! recycled, which is why `pointer_offset() == hash_offset()`.

use arrow::datatypes::DataType;

use crate::error::Result;
use crate::internal_err;

/// Width of a variable-length cell: u32 length + u64 pointer
pub const VAR_CELL_WIDTH: usize = 12;
/// Width of the heap blob header (total blob size, including the header)
pub const HEAP_BLOB_HEADER: usize = 4;

/// Fixed byte width of a cell of `data_type`, or `None` for variable-length
/// types
pub fn fixed_cell_width(data_type: &DataType) -> Option<usize> {
    match data_type {
        DataType::Boolean | DataType::Int8 | DataType::UInt8 => Some(1),
        DataType::Int16 | DataType::UInt16 => Some(2),
        DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::Date32 => {
            Some(4)
        }
        DataType::Int64 | DataType::UInt64 | DataType::Float64 | DataType::Date64 => {
            Some(8)
        }
        DataType::Utf8 | DataType::Binary => None,
        _ => None,
    }
}

fn supported(data_type: &DataType) -> bool {
    fixed_cell_width(data_type).is_some()
        || matches!(data_type, DataType::Utf8 | DataType::Binary)
}

/// Byte layout of the row store: key columns, build payload columns, an
/// optional match flag and the row hash.
#[derive(Debug, Clone)]
pub struct RowLayout {
    /// Column types, key columns first
    types: Vec<DataType>,
    /// Width of the null-bit prefix
    null_width: usize,
    /// Offset of the per-row heap pointer; present iff a column is
    /// variable-length
    heap_pointer_offset: Option<usize>,
    /// Offset of each column cell
    offsets: Vec<usize>,
    /// Offset of the match flag, present only for right/full outer joins
    match_offset: Option<usize>,
    /// Offset of the hash; the chain next pointer overlays it after finalize
    hash_offset: usize,
    /// Total width of a row
    row_width: usize,
}

impl RowLayout {
    /// Create a layout for `types`, with a match flag iff `has_match_flag`
    pub fn try_new(types: Vec<DataType>, has_match_flag: bool) -> Result<Self> {
        for data_type in &types {
            if !supported(data_type) {
                return internal_err!("Unsupported row layout type: {data_type}");
            }
        }
        let null_width = types.len().div_ceil(8);
        let all_constant = types
            .iter()
            .all(|t| fixed_cell_width(t).is_some());

        let mut offset = null_width;
        let heap_pointer_offset = if all_constant {
            None
        } else {
            let o = offset;
            offset += 8;
            Some(o)
        };

        let mut offsets = Vec::with_capacity(types.len());
        for data_type in &types {
            offsets.push(offset);
            offset += fixed_cell_width(data_type).unwrap_or(VAR_CELL_WIDTH);
        }

        let match_offset = if has_match_flag {
            let o = offset;
            offset += 1;
            Some(o)
        } else {
            None
        };

        let hash_offset = offset;
        offset += 8;

        Ok(Self {
            types,
            null_width,
            heap_pointer_offset,
            offsets,
            match_offset,
            hash_offset,
            row_width: offset,
        })
    }

    /// Column types, key columns first
    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    /// Number of columns stored per row (excluding match flag and hash)
    pub fn column_count(&self) -> usize {
        self.types.len()
    }

    /// Offset of column `col`'s cell
    pub fn offset(&self, col: usize) -> usize {
        self.offsets[col]
    }

    /// Width of the null-bit prefix in bytes
    pub fn null_width(&self) -> usize {
        self.null_width
    }

    /// True when no column needs heap storage
    pub fn all_constant(&self) -> bool {
        self.heap_pointer_offset.is_none()
    }

    /// Offset of the per-row heap pointer. Only meaningful when
    /// `!all_constant()`.
    pub fn heap_pointer_offset(&self) -> Option<usize> {
        self.heap_pointer_offset
    }

    /// Offset of the match flag, when the layout carries one
    pub fn match_offset(&self) -> Option<usize> {
        self.match_offset
    }

    /// Offset of the row just past the last data column: the match flag when
    /// present, otherwise the hash
    pub fn tuple_size(&self) -> usize {
        self.match_offset.unwrap_or(self.hash_offset)
    }

    /// Offset of the stored hash
    pub fn hash_offset(&self) -> usize {
        self.hash_offset
    }

    /// Offset of the chain next pointer, which overlays the hash slot once
    /// the bucket array has been built
    pub fn pointer_offset(&self) -> usize {
        self.hash_offset
    }

    /// Total width of one row in bytes
    pub fn row_width(&self) -> usize {
        self.row_width
    }
}
