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

//! Platform wait primitives: the per-worker wakeup channel and the multi-wait
//! the loopers block in.
//!
//! Every backend exposes the same three pieces: [`WakeupChannel`]
//! (`create`/`signal`, destroyed on drop), [`DataWaiter`] (blocks on
//! {device readable, wakeup}) and [`wait_wakeup_or_timeout`] (the event
//! looper's cancellable tick). Cancellation is always a signal on the wakeup
//! channel; the device handle itself is never touched for that purpose.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use self::linux::WakeupChannel;
#[cfg(target_os = "macos")]
pub use self::macos::WakeupChannel;
#[cfg(unix)]
pub(crate) use self::posix::{wait_wakeup_or_timeout, DataWaiter};
#[cfg(windows)]
pub use self::windows::WakeupChannel;
#[cfg(windows)]
pub(crate) use self::windows::{wait_wakeup_or_timeout, DataWaiter};

/// Opaque platform handle of an already-opened serial device.
#[cfg(unix)]
pub type RawDeviceHandle = std::os::unix::io::RawFd;
/// Opaque platform handle of an already-opened serial device
/// (the integer value of a Win32 `HANDLE`).
#[cfg(windows)]
pub type RawDeviceHandle = isize;

/// Which side of the data looper's multi-wait fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The device handle became readable (or entered an error state that a
    /// subsequent read will surface).
    Readable,
    /// The wakeup channel was signaled.
    Wakeup,
}

/// Outcome of the event looper's bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// The poll interval elapsed with no signal.
    Elapsed,
    /// The wakeup channel was signaled.
    Wakeup,
}
