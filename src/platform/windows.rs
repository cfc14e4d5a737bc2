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

use std::ffi::c_void;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use windows::core::PCWSTR;
use windows::Win32::Devices::Communication::{SetCommMask, WaitCommEvent, COMM_EVENT_MASK, EV_RXCHAR};
use windows::Win32::Foundation::{CloseHandle, ERROR_IO_PENDING, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, WaitForSingleObject, INFINITE,
};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use super::{RawDeviceHandle, TickOutcome, WaitOutcome};

fn win_err(error: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(error.code().0)
}

/// Wakeup channel backed by an auto-reset Win32 event object.
///
/// `SetEvent` on an auto-reset event stays signaled until one waiter
/// consumes it, so a signal delivered before the waiter parks is not lost.
#[derive(Debug)]
pub struct WakeupChannel {
    event: HANDLE,
}

// A Win32 event handle is safe to signal and wait on from any thread.
unsafe impl Send for WakeupChannel {}
unsafe impl Sync for WakeupChannel {}

impl WakeupChannel {
    pub fn create() -> io::Result<Self> {
        let event =
            unsafe { CreateEventW(None, false, false, PCWSTR::null()) }.map_err(win_err)?;
        Ok(Self { event })
    }

    /// Makes the channel signaled. Safe to call from any thread, including
    /// when no thread is currently waiting.
    pub fn signal(&self) -> io::Result<()> {
        unsafe { SetEvent(self.event) }.map_err(win_err)
    }

    pub(crate) fn raw_event(&self) -> HANDLE {
        self.event
    }
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

/// Blocks on {`WaitCommEvent(EV_RXCHAR)` completion, wakeup signaled} for one
/// data looper, using overlapped I/O so the pending comm wait can be left
/// outstanding across a wakeup-only wake.
pub(crate) struct DataWaiter {
    device: HANDLE,
    wakeup: Arc<WakeupChannel>,
    overlapped_event: HANDLE,
    overlapped: OVERLAPPED,
    event_mask: COMM_EVENT_MASK,
    pending: bool,
}

// The overlapped state is only ever touched from the looper thread owning
// this waiter; the raw handles themselves are thread-safe.
unsafe impl Send for DataWaiter {}

impl DataWaiter {
    pub fn new(device: RawDeviceHandle, wakeup: Arc<WakeupChannel>) -> io::Result<Self> {
        let device = HANDLE(device as *mut c_void);
        unsafe { SetCommMask(device, EV_RXCHAR) }.map_err(win_err)?;
        // Manual-reset, as required for an event referenced by OVERLAPPED.
        let overlapped_event =
            unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.map_err(win_err)?;
        Ok(Self {
            device,
            wakeup,
            overlapped_event,
            overlapped: OVERLAPPED::default(),
            event_mask: COMM_EVENT_MASK(0),
            pending: false,
        })
    }

    /// Waits with no timeout; cancellation arrives through the wakeup
    /// channel.
    pub fn wait(&mut self) -> io::Result<WaitOutcome> {
        unsafe {
            if !self.pending {
                self.overlapped = OVERLAPPED::default();
                self.overlapped.hEvent = self.overlapped_event;
                match WaitCommEvent(self.device, &mut self.event_mask, Some(&mut self.overlapped)) {
                    Ok(()) => {
                        let _ = ResetEvent(self.overlapped_event);
                        return Ok(WaitOutcome::Readable);
                    }
                    Err(error) if error.code() == ERROR_IO_PENDING.to_hresult() => {
                        self.pending = true;
                    }
                    Err(error) => return Err(win_err(error)),
                }
            }

            let handles = [self.overlapped_event, self.wakeup.raw_event()];
            let fired = WaitForMultipleObjects(&handles, false, INFINITE);
            if fired == WAIT_OBJECT_0 {
                let mut transferred = 0u32;
                GetOverlappedResult(self.device, &self.overlapped, &mut transferred, false)
                    .map_err(win_err)?;
                self.pending = false;
                let _ = ResetEvent(self.overlapped_event);
                return Ok(WaitOutcome::Readable);
            }
            if fired.0 == WAIT_OBJECT_0.0 + 1 {
                // The comm wait stays pending and is resumed on the next call.
                return Ok(WaitOutcome::Wakeup);
            }
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for DataWaiter {
    fn drop(&mut self) {
        unsafe {
            if self.pending {
                let _ = CancelIoEx(self.device, Some(&self.overlapped));
                let mut transferred = 0u32;
                let _ =
                    GetOverlappedResult(self.device, &self.overlapped, &mut transferred, true);
            }
            let _ = CloseHandle(self.overlapped_event);
        }
    }
}

/// Bounded wait on the wakeup channel alone, used by the event looper's
/// status polling tick.
pub(crate) fn wait_wakeup_or_timeout(
    wakeup: &WakeupChannel,
    timeout: Duration,
) -> io::Result<TickOutcome> {
    let timeout_ms = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
    let fired = unsafe { WaitForSingleObject(wakeup.raw_event(), timeout_ms) };
    if fired == WAIT_OBJECT_0 {
        return Ok(TickOutcome::Wakeup);
    }
    if fired == WAIT_TIMEOUT {
        return Ok(TickOutcome::Elapsed);
    }
    Err(io::Error::last_os_error())
}
