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

//! Event and task contracts consumed by the join kernel.
//!
//! The kernel defines units of parallel work as opaque [`Task`]s enumerated
//! by an [`Event`]. The host's task runtime decides where and when tasks run;
//! [`run_event`] is a minimal scoped-thread runner for hosts (and tests) that
//! do not bring their own.

use std::thread;

use crate::error::Result;
use crate::internal_err;

/// How much work one `execute_task` call should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecutionMode {
    /// Run the task to completion
    ProcessAll,
    /// Run a slice of the task and yield
    ProcessPartial,
}

/// Outcome of one `execute_task` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecutionResult {
    /// The task is done
    Finished,
    /// The task yielded and wants to be scheduled again
    Blocked,
}

/// A unit of work scheduled by an [`Event`]. Work within a task is
/// synchronous; there are no suspension points inside the kernel.
pub trait Task: Send {
    fn execute_task(&mut self, mode: TaskExecutionMode) -> Result<TaskExecutionResult>;
}

/// A lifecycle with two hooks: `schedule` enumerates the event's tasks, and
/// `finish_event` runs once after every task completed
pub trait Event: Send + Sync {
    fn schedule(&self) -> Result<Vec<Box<dyn Task>>>;
    fn finish_event(&self) -> Result<()>;
}

/// Run all of `event`'s tasks on scoped threads, then invoke its finish
/// hook. The first task error wins; the finish hook does not run when a task
/// failed.
pub fn run_event(event: &dyn Event) -> Result<()> {
    let tasks = event.schedule()?;
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|mut task| {
                scope.spawn(move || loop {
                    match task.execute_task(TaskExecutionMode::ProcessAll)? {
                        TaskExecutionResult::Finished => return Ok(()),
                        TaskExecutionResult::Blocked => continue,
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| internal_err!("task panicked"))
            })
            .collect()
    });
    for result in results {
        result?;
    }
    event.finish_event()
}
