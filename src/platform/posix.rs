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

//! `poll(2)`-based multi-wait shared by the Linux and macOS backends; only
//! the wakeup channel object differs between the two.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use super::{RawDeviceHandle, TickOutcome, WaitOutcome, WakeupChannel};

/// Blocks on {device readable, wakeup signaled} for one data looper.
pub(crate) struct DataWaiter {
    device_fd: RawDeviceHandle,
    wakeup: Arc<WakeupChannel>,
}

impl DataWaiter {
    pub fn new(device: RawDeviceHandle, wakeup: Arc<WakeupChannel>) -> io::Result<Self> {
        Ok(Self {
            device_fd: device,
            wakeup,
        })
    }

    /// Waits with no timeout; cancellation arrives through the wakeup
    /// channel. `ErrorKind::Interrupted` must be retried by the caller.
    pub fn wait(&mut self) -> io::Result<WaitOutcome> {
        let mut fds = [
            libc::pollfd {
                fd: self.device_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wakeup.raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if fds[1].revents & libc::POLLIN != 0 {
            self.wakeup.drain();
            return Ok(WaitOutcome::Wakeup);
        }
        // POLLERR/POLLHUP on the device are reported as readable; the
        // subsequent read surfaces the actual condition.
        Ok(WaitOutcome::Readable)
    }
}

/// Bounded wait on the wakeup channel alone, used by the event looper's
/// status polling tick.
pub(crate) fn wait_wakeup_or_timeout(
    wakeup: &WakeupChannel,
    timeout: Duration,
) -> io::Result<TickOutcome> {
    let mut fds = [libc::pollfd {
        fd: wakeup.raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(TickOutcome::Elapsed);
    }
    wakeup.drain();
    Ok(TickOutcome::Wakeup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pipe_fds() -> (RawDeviceHandle, RawDeviceHandle) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close_fds(fds: (RawDeviceHandle, RawDeviceHandle)) {
        unsafe {
            libc::close(fds.0);
            libc::close(fds.1);
        }
    }

    #[test]
    fn signal_before_wait_still_wakes() {
        let fds = pipe_fds();
        let wakeup = Arc::new(WakeupChannel::create().unwrap());
        wakeup.signal().unwrap();

        let mut waiter = DataWaiter::new(fds.0, wakeup).unwrap();
        assert_eq!(waiter.wait().unwrap(), WaitOutcome::Wakeup);
        close_fds(fds);
    }

    #[test]
    fn readable_device_wins_over_idle_wakeup() {
        let fds = pipe_fds();
        let wakeup = Arc::new(WakeupChannel::create().unwrap());
        assert_eq!(unsafe { libc::write(fds.1, b"x".as_ptr() as *const _, 1) }, 1);

        let mut waiter = DataWaiter::new(fds.0, wakeup).unwrap();
        assert_eq!(waiter.wait().unwrap(), WaitOutcome::Readable);
        close_fds(fds);
    }

    #[test]
    fn tick_wait_elapses_without_signal() {
        let wakeup = WakeupChannel::create().unwrap();
        let start = Instant::now();
        let outcome = wait_wakeup_or_timeout(&wakeup, Duration::from_millis(50)).unwrap();
        assert_eq!(outcome, TickOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn tick_wait_returns_promptly_on_signal() {
        let wakeup = WakeupChannel::create().unwrap();
        wakeup.signal().unwrap();
        let start = Instant::now();
        let outcome = wait_wakeup_or_timeout(&wakeup, Duration::from_secs(10)).unwrap();
        assert_eq!(outcome, TickOutcome::Wakeup);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
