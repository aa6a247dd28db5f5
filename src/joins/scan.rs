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

//! [`ScanStructure`]: per-probe-chunk chain walker and result builder.
//!
//! A scan structure holds the pointer frontier of one probe chunk: one chain
//! pointer per probe row, plus the selection of rows whose chain is not yet
//! exhausted. `next` dispatches on the join type; inner-style joins may emit
//! several result chunks per probe chunk, the one-pass joins (semi, anti,
//! mark, single) resolve the whole chunk in a single call and mirror its row
//! order.

use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef, BooleanArray};
use arrow::record_batch::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::error::Result;
use crate::join_type::JoinType;
use crate::joins::hash_index::HashIndex;
use crate::joins::hash_table::{take_batch, JoinHashTable};
use crate::row::ops;

/// Iterator state for probing one chunk against a [`JoinHashTable`]
pub struct ScanStructure<'a> {
    ht: &'a JoinHashTable,
    /// The probe chunk's key columns
    key_data: Vec<ArrayRef>,
    /// Chain pointer per probe row (zero = exhausted)
    pointers: Vec<u64>,
    /// Probe rows whose chain still has entries
    sel_vector: Vec<usize>,
    /// Per-probe-row match flag; absent for inner joins
    found_match: Option<Vec<bool>>,
    /// Rows deferred to a later external round; `None` means all rows are
    /// owned by this round
    active: Option<Vec<bool>>,
    input_rows: usize,
    finished: bool,
}

impl<'a> ScanStructure<'a> {
    pub(crate) fn new(ht: &'a JoinHashTable, keys: &RecordBatch) -> Self {
        let input_rows = keys.num_rows();
        Self {
            ht,
            key_data: keys.columns().to_vec(),
            pointers: vec![0; input_rows],
            sel_vector: Vec::new(),
            found_match: ht
                .join_type()
                .needs_found_match()
                .then(|| vec![false; input_rows]),
            active: None,
            input_rows,
            finished: false,
        }
    }

    /// Load the chain heads for the selected rows and keep the non-empty ones
    pub(crate) fn init_chains(&mut self, index: &HashIndex, hashes: &[u64], sel: &[usize]) {
        for &idx in sel {
            let head = index.chain_head(hashes[idx]);
            if head != 0 {
                self.pointers[idx] = head;
                self.sel_vector.push(idx);
            }
        }
    }

    /// Exclude rows from this round's output; they were sunk into the
    /// residual table and will be emitted by the round owning their partition
    pub(crate) fn deactivate(&mut self, sel: &[usize]) {
        let active = self
            .active
            .get_or_insert_with(|| vec![true; self.input_rows]);
        for &idx in sel {
            active[idx] = false;
        }
    }

    fn is_active(&self, idx: usize) -> bool {
        self.active.as_ref().map_or(true, |a| a[idx])
    }

    fn active_sel(&self) -> Vec<usize> {
        (0..self.input_rows).filter(|&i| self.is_active(i)).collect()
    }

    /// Produce the next result chunk, or an empty chunk when this probe chunk
    /// is exhausted. `left` is the full probe-side chunk; `schema` the result
    /// schema for this join type.
    pub fn next(&mut self, left: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
        if self.finished {
            return Ok(RecordBatch::new_empty(Arc::clone(schema)));
        }
        if self.ht.count() == 0 {
            self.finished = true;
            return self.empty_build_result(left, schema);
        }
        match self.ht.join_type() {
            JoinType::Inner | JoinType::Right => self.next_inner_join(left, schema),
            JoinType::Semi => self.next_semi_join(left, schema),
            JoinType::Anti => self.next_anti_join(left, schema),
            JoinType::Mark => self.next_mark_join(left, schema),
            JoinType::Left | JoinType::Outer => self.next_left_join(left, schema),
            JoinType::Single => self.next_single_join(left, schema),
        }
    }

    /// Empty build side: inner-style and existence-positive joins produce
    /// nothing, left/anti produce the full probe side, mark produces firm
    /// false marks
    fn empty_build_result(
        &self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        let active = self.active_sel();
        match self.ht.join_type() {
            JoinType::Inner | JoinType::Right | JoinType::Semi | JoinType::Single => {
                Ok(RecordBatch::new_empty(Arc::clone(schema)))
            }
            JoinType::Anti => take_batch(left, &active),
            JoinType::Left | JoinType::Outer => {
                let rows = take_batch(left, &active)?;
                let mut columns = rows.columns().to_vec();
                for data_type in self.ht.build_types() {
                    columns.push(new_null_array(data_type, active.len()));
                }
                Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
            }
            JoinType::Mark => {
                let rows = take_batch(left, &active)?;
                let mut columns = rows.columns().to_vec();
                let marks: BooleanArray =
                    std::iter::repeat(Some(false)).take(active.len()).collect();
                columns.push(Arc::new(marks));
                Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
            }
        }
    }

    /// Evaluate all predicates against the current pointer frontier,
    /// returning the matched rows and appending the failed ones to `no_match`
    fn resolve_predicates(&self, no_match: Option<&mut Vec<usize>>) -> Vec<usize> {
        let mut sel = self.sel_vector.clone();
        ops::match_rows(
            &self.key_data,
            self.ht.layout(),
            &self.pointers,
            self.ht.conditions(),
            &mut sel,
            no_match,
        );
        sel
    }

    /// Advance the given rows one link down their chain, keeping the rows
    /// whose chain has not ended as the new frontier
    fn advance_pointers(&mut self, sel: &[usize]) {
        let pointer_offset = self.ht.layout().pointer_offset() as u64;
        let mut next_sel = Vec::with_capacity(sel.len());
        for &idx in sel {
            let next = unsafe { ops::read_u64(self.pointers[idx] + pointer_offset) };
            self.pointers[idx] = next;
            if next != 0 {
                next_sel.push(idx);
            }
        }
        self.sel_vector = next_sel;
    }

    fn advance_all_pointers(&mut self) {
        let sel = std::mem::take(&mut self.sel_vector);
        self.advance_pointers(&sel);
    }

    /// Keep resolving and advancing until at least one row matches or every
    /// chain is exhausted
    fn scan_inner_join(&mut self) -> Vec<usize> {
        loop {
            if self.sel_vector.is_empty() {
                return Vec::new();
            }
            let match_sel = self.resolve_predicates(None);
            if let Some(found) = &mut self.found_match {
                for &idx in &match_sel {
                    found[idx] = true;
                }
            }
            if !match_sel.is_empty() {
                return match_sel;
            }
            self.advance_all_pointers();
        }
    }

    fn next_inner_join(
        &mut self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        let match_sel = self.scan_inner_join();
        if match_sel.is_empty() {
            return Ok(RecordBatch::new_empty(Arc::clone(schema)));
        }

        if self.ht.join_type().is_right_outer() {
            // mark matched build rows; concurrent probes may race here, but
            // every writer stores the same value
            let tuple_size = self.ht.layout().tuple_size();
            for &idx in &match_sel {
                unsafe { ops::set_match_flag(self.pointers[idx], tuple_size) };
            }
        }

        let left_rows = take_batch(left, &match_sel)?;
        let mut columns = left_rows.columns().to_vec();
        let key_count = self.ht.conditions().len();
        for i in 0..self.ht.build_types().len() {
            columns.push(ops::gather_column(
                self.ht.layout(),
                key_count + i,
                &self.pointers,
                &match_sel,
                None,
                match_sel.len(),
            )?);
        }
        self.advance_all_pointers();
        Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
    }

    /// Chase every chain to the end once, recording which probe rows found a
    /// match. Matched rows stop walking; only the unmatched continue.
    fn scan_key_matches(&mut self) {
        while !self.sel_vector.is_empty() {
            let mut no_match = Vec::new();
            let match_sel = self.resolve_predicates(Some(&mut no_match));
            let found = self
                .found_match
                .as_mut()
                .expect("one-pass joins track matches");
            for &idx in &match_sel {
                found[idx] = true;
            }
            self.advance_pointers(&no_match);
        }
    }

    fn semi_anti_sel(&self, want_match: bool) -> Vec<usize> {
        let found = self
            .found_match
            .as_ref()
            .expect("one-pass joins track matches");
        (0..self.input_rows)
            .filter(|&i| found[i] == want_match && self.is_active(i))
            .collect()
    }

    fn next_semi_join(
        &mut self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        self.scan_key_matches();
        self.finished = true;
        let sel = self.semi_anti_sel(true);
        let batch = take_batch(left, &sel)?;
        Ok(RecordBatch::try_new(Arc::clone(schema), batch.columns().to_vec())?)
    }

    fn next_anti_join(
        &mut self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        self.scan_key_matches();
        self.finished = true;
        let sel = self.semi_anti_sel(false);
        let batch = take_batch(left, &sel)?;
        Ok(RecordBatch::try_new(Arc::clone(schema), batch.columns().to_vec())?)
    }

    fn next_mark_join(
        &mut self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        self.scan_key_matches();
        self.finished = true;
        let found = self
            .found_match
            .as_ref()
            .expect("mark joins track matches");

        let mut values: Vec<bool> = found.clone();
        let mut validity = vec![true; self.input_rows];

        match self.ht.correlated_mark() {
            None => {
                // NULL keys on a condition that does not treat NULLs as equal
                // make the mark NULL
                for (col, condition) in self.ht.conditions().iter().enumerate() {
                    if condition.comparison.null_equal() {
                        continue;
                    }
                    let column = &self.key_data[col];
                    if column.null_count() == 0 {
                        continue;
                    }
                    for (idx, valid) in validity.iter_mut().enumerate() {
                        if column.is_null(idx) {
                            *valid = false;
                        }
                    }
                }
                // a non-match against a build side with NULL keys is unknown,
                // not false
                if self.ht.has_null() {
                    for idx in 0..self.input_rows {
                        if !values[idx] {
                            validity[idx] = false;
                        }
                    }
                }
            }
            Some(info) => {
                let correlated = info.column_count();
                let (count_star, count) =
                    info.fetch_aggregates(&self.key_data[..correlated], self.input_rows)?;
                // the mark's validity follows the actual key column
                let key_column = &self.key_data[self.key_data.len() - 1];
                for idx in 0..self.input_rows {
                    validity[idx] = !key_column.is_null(idx);
                    debug_assert!(count_star[idx] >= count[idx]);
                    if !values[idx] && count_star[idx] > count[idx] {
                        // the group has NULL keys: false becomes unknown
                        validity[idx] = false;
                    }
                    if count_star[idx] == 0 {
                        // empty group: the result is a firm false
                        values[idx] = false;
                        validity[idx] = true;
                    }
                }
            }
        }

        let sel = self.active_sel();
        let rows = take_batch(left, &sel)?;
        let mut columns = rows.columns().to_vec();
        let marks: BooleanArray = sel
            .iter()
            .map(|&idx| validity[idx].then_some(values[idx]))
            .collect();
        columns.push(Arc::new(marks));
        Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
    }

    fn next_left_join(
        &mut self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        let result = self.next_inner_join(left, schema)?;
        if result.num_rows() > 0 {
            return Ok(result);
        }
        // no inner tuples are left: emit one tuple per unmatched probe row,
        // with the build columns set to NULL
        self.finished = true;
        let found = self
            .found_match
            .as_ref()
            .expect("left joins track matches");
        let sel: Vec<usize> = (0..self.input_rows)
            .filter(|&i| !found[i] && self.is_active(i))
            .collect();
        if sel.is_empty() {
            return Ok(RecordBatch::new_empty(Arc::clone(schema)));
        }
        let rows = take_batch(left, &sel)?;
        let mut columns = rows.columns().to_vec();
        for data_type in self.ht.build_types() {
            columns.push(new_null_array(data_type, sel.len()));
        }
        Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
    }

    fn next_single_join(
        &mut self,
        left: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<RecordBatch> {
        let mut result_sel = Vec::new();
        while !self.sel_vector.is_empty() {
            let mut no_match = Vec::new();
            let match_sel = self.resolve_predicates(Some(&mut no_match));
            let found = self
                .found_match
                .as_mut()
                .expect("single joins track matches");
            for &idx in &match_sel {
                // first match wins; matched rows stop walking their chain
                found[idx] = true;
                result_sel.push(idx);
            }
            self.advance_pointers(&no_match);
        }
        self.finished = true;

        let key_count = self.ht.conditions().len();
        let mut columns = left.columns().to_vec();
        for i in 0..self.ht.build_types().len() {
            columns.push(ops::gather_column(
                self.ht.layout(),
                key_count + i,
                &self.pointers,
                &result_sel,
                Some(&result_sel),
                self.input_rows,
            )?);
        }
        let batch = RecordBatch::try_new(Arc::clone(schema), columns)?;
        match &self.active {
            None => Ok(batch),
            Some(_) => take_batch(&batch, &self.active_sel()),
        }
    }

    /// Whether this probe chunk has been fully resolved
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Per-row match flags, for joins that track them
    pub fn found_match(&self) -> Option<&[bool]> {
        self.found_match.as_deref()
    }
}

impl std::fmt::Debug for ScanStructure<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStructure")
            .field("input_rows", &self.input_rows)
            .field("remaining_chains", &self.sel_vector.len())
            .field("finished", &self.finished)
            .finish()
    }
}
