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

//! Error types for the join kernel.
//!
//! Two kinds of errors can be raised:
//!
//! 1. Expected errors, such as the buffer manager running out of memory
//!    ([`JoinError::ResourcesExhausted`]) or a malformed input chunk
//!    ([`JoinError::Execution`]).
//!
//! 2. Unexpected errors ([`JoinError::Internal`]), which indicate that an
//!    internal invariant has been broken and are most likely a bug.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::result;

use arrow::error::ArrowError;

/// Result type for operations that could result in a [`JoinError`]
pub type Result<T, E = JoinError> = result::Result<T, E>;

/// Error returned by the join kernel
#[derive(Debug)]
pub enum JoinError {
    /// Error returned by arrow
    ArrowError(ArrowError),
    /// Error due to a broken internal invariant.
    ///
    /// This error should not happen in normal usage. It results from
    /// something that wasn't expected by the implementation; callers cannot
    /// trigger it by feeding in malformed chunks alone.
    Internal(String),
    /// Error during execution against user-provided input
    Execution(String),
    /// Error when a resource, such as buffer-managed memory, is exhausted.
    ///
    /// The partitioned build path is the recovery mechanism for the in-memory
    /// path; a resource failure there aborts the query.
    ResourcesExhausted(String),
}

impl Display for JoinError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            JoinError::ArrowError(e) => write!(f, "Arrow error: {e}"),
            JoinError::Internal(desc) => {
                write!(
                    f,
                    "Internal error: {desc}.\nThis was likely caused by a bug \
                     in the join kernel's code and we would welcome that you \
                     file an bug report in our issue tracker"
                )
            }
            JoinError::Execution(desc) => write!(f, "Execution error: {desc}"),
            JoinError::ResourcesExhausted(desc) => {
                write!(f, "Resources exhausted: {desc}")
            }
        }
    }
}

impl Error for JoinError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JoinError::ArrowError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArrowError> for JoinError {
    fn from(e: ArrowError) -> Self {
        JoinError::ArrowError(e)
    }
}

/// Macro wraps `$ERR` to add backtrace feature
#[macro_export]
macro_rules! internal_err {
    ($($args:expr),*) => {
        Err($crate::error::JoinError::Internal(format!($($args),*)))
    };
}

/// Macro for creating an execution error
#[macro_export]
macro_rules! exec_err {
    ($($args:expr),*) => {
        Err($crate::error::JoinError::Execution(format!($($args),*)))
    };
}

/// Macro for creating a resources-exhausted error
#[macro_export]
macro_rules! resources_err {
    ($($args:expr),*) => {
        Err($crate::error::JoinError::ResourcesExhausted(format!($($args),*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = JoinError::Execution("mismatched cardinality".to_string());
        assert_eq!(e.to_string(), "Execution error: mismatched cardinality");
    }

    #[test]
    fn arrow_error_source() {
        let e = JoinError::from(ArrowError::ComputeError("x".to_string()));
        assert!(e.source().is_some());
    }

    #[test]
    fn macros_produce_variants() {
        let r: Result<()> = internal_err!("bad {}", "state");
        assert!(matches!(r, Err(JoinError::Internal(_))));
        let r: Result<()> = exec_err!("nope");
        assert!(matches!(r, Err(JoinError::Execution(_))));
        let r: Result<()> = resources_err!("oom");
        assert!(matches!(r, Err(JoinError::ResourcesExhausted(_))));
    }
}
