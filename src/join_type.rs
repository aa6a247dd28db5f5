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

//! Defines the [`JoinType`], [`Comparison`] and [`JoinCondition`] types.

use std::fmt::{self, Display, Formatter};

use arrow::datatypes::DataType;

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Inner Join - Returns only rows where the join condition holds on both
    /// sides.
    Inner,
    /// Left Join - Returns all rows from the probe side and matching rows
    /// from the build side. If no match, NULL values are returned for the
    /// build columns.
    Left,
    /// Right Join - Like [`JoinType::Inner`] on the probe path, but build
    /// rows track whether they were matched so the build-side tail can be
    /// emitted afterwards.
    Right,
    /// Full Outer Join - Combines [`JoinType::Left`] and [`JoinType::Right`]:
    /// unmatched rows from either side are returned with NULLs for the other
    /// side.
    Outer,
    /// Semi Join - Returns probe rows that have at least one match on the
    /// build side. Only probe columns are returned, each input row at most
    /// once.
    Semi,
    /// Anti Join - Returns probe rows that have no match on the build side.
    Anti,
    /// Mark Join
    ///
    /// Returns one record for each probe row plus an additional boolean
    /// "mark" column which is true if there is at least one match on the
    /// build side. When the row's key is NULL on a condition that does not
    /// treat NULLs as equal, or when there was no match but the build side
    /// contains NULL keys, the mark is NULL (SQL `IN` semantics). Used to
    /// decorrelate `EXISTS`/`IN` subqueries inside disjunctive predicates.
    Mark,
    /// Single Join - Returns one record for each probe row with the build
    /// columns of the first matching build row, or NULLs when there is no
    /// match. Used to decorrelate scalar subqueries.
    Single,
}

impl JoinType {
    /// Build rows of right and full outer joins carry a match flag so the
    /// unmatched build-side tail can be scanned out after all probes finish.
    pub fn is_right_outer(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Outer)
    }

    /// All join types except INNER need per-probe-row match bookkeeping.
    pub fn needs_found_match(self) -> bool {
        self != JoinType::Inner
    }

    /// Single-pass joins resolve an entire probe chunk in one call and mirror
    /// its row order in the output.
    pub fn is_single_pass(self) -> bool {
        matches!(
            self,
            JoinType::Semi | JoinType::Anti | JoinType::Mark | JoinType::Single
        )
    }
}

impl Display for JoinType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let join_type = match self {
            JoinType::Inner => "Inner",
            JoinType::Left => "Left",
            JoinType::Right => "Right",
            JoinType::Outer => "Outer",
            JoinType::Semi => "Semi",
            JoinType::Anti => "Anti",
            JoinType::Mark => "Mark",
            JoinType::Single => "Single",
        };
        write!(f, "{join_type}")
    }
}

/// Comparison kind of a single join condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    /// `=`
    Equal,
    /// `<>`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// `IS NOT DISTINCT FROM`: equality that treats two NULLs as equal
    NotDistinctFrom,
    /// `IS DISTINCT FROM`: inequality that treats two NULLs as equal
    DistinctFrom,
}

impl Comparison {
    /// Whether NULL values on this condition's column participate in
    /// matching. Derived from the comparison kind; controls both NULL
    /// filtering and the MARK NULL rule.
    pub fn null_equal(self) -> bool {
        matches!(self, Comparison::NotDistinctFrom | Comparison::DistinctFrom)
    }

    /// Hashed equality comparisons; these route rows to hash buckets and must
    /// prefix the condition list. `DistinctFrom` is *not* one of them: rows
    /// that satisfy it hash to different buckets, so it is evaluated as a
    /// residual predicate instead.
    pub fn is_equality(self) -> bool {
        matches!(self, Comparison::Equal | Comparison::NotDistinctFrom)
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let op = match self {
            Comparison::Equal => "=",
            Comparison::NotEqual => "<>",
            Comparison::LessThan => "<",
            Comparison::LessThanOrEqual => "<=",
            Comparison::GreaterThan => ">",
            Comparison::GreaterThanOrEqual => ">=",
            Comparison::NotDistinctFrom => "IS NOT DISTINCT FROM",
            Comparison::DistinctFrom => "IS DISTINCT FROM",
        };
        write!(f, "{op}")
    }
}

/// A single join condition: both sides produce a value of `data_type`,
/// compared with `comparison`. The i-th condition compares the i-th key
/// column of the build and probe chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinCondition {
    /// Type of the key expression on both sides
    pub data_type: DataType,
    /// How the two sides are compared
    pub comparison: Comparison,
}

impl JoinCondition {
    pub fn new(data_type: DataType, comparison: Comparison) -> Self {
        Self {
            data_type,
            comparison,
        }
    }

    /// Shorthand for the common equality condition
    pub fn equal(data_type: DataType) -> Self {
        Self::new(data_type, Comparison::Equal)
    }
}
