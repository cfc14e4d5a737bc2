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

use std::io;

use crate::consumer::LineEvents;
use crate::platform::RawDeviceHandle;

/// Boundary to the component that opened and configured the serial device.
///
/// The looper subsystem borrows the handle for the lifetime of a
/// registration; it never opens, reconfigures or closes the device. The
/// caller must keep the handle open until every listener registered for it
/// has been unregistered.
pub trait DevicePort: Send + Sync {
    /// The platform handle the loopers wait on. Used as the registry key, so
    /// it must stay stable for the lifetime of the port.
    fn raw_handle(&self) -> RawDeviceHandle;

    /// Reads currently available bytes without blocking.
    ///
    /// Returns `Ok(0)` when nothing is pending (a spurious wake, not end of
    /// stream), `ErrorKind::WouldBlock` when the device is drained and
    /// `ErrorKind::Interrupted` for transient signal interruption; both are
    /// handled inside the data looper. Any other error is forwarded to the
    /// consumer as a hard read error.
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queries the current modem control line state.
    fn line_status(&self) -> io::Result<LineEvents>;
}
