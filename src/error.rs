// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Error type for listener registration and teardown operations.
///
/// Transient I/O conditions inside a running looper (interrupted waits,
/// interrupted reads) never surface here; they are retried internally. Hard
/// read errors are delivered through
/// [`SerialEventConsumer::on_data_error`](crate::SerialEventConsumer::on_data_error)
/// and do not stop the looper.
#[derive(Error, Debug)]
pub enum LooperError {
    /// The handle registry has no free slot left.
    #[error("no free registry slot available (capacity {0})")]
    ResourceExhausted(usize),

    /// A listener of the requested kind already exists for this handle.
    #[error("a listener of this kind is already registered for this handle")]
    AlreadyRegistered,

    /// No listener of the requested kind exists for this handle.
    #[error("no listener of this kind is registered for this handle")]
    NotRegistered,

    /// Thread creation or looper initialization failed; the registry is left
    /// exactly as it was before the call.
    #[error("failed to start looper thread: {0}")]
    SpawnFailed(String),

    /// Joining the looper thread failed. The caller must treat the looper as
    /// possibly still running if the reason indicates the wakeup signal could
    /// not be delivered.
    #[error("failed to join looper thread: {0}")]
    JoinFailed(String),

    /// A registry/slot invariant was broken. Fatal in debug builds.
    #[error("registry invariant violated: {0}")]
    InvariantViolation(&'static str),
}
