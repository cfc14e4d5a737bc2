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
use std::os::unix::io::RawFd;

/// Wakeup channel backed by an eventfd.
///
/// Signaling writes to the counter, so a signal delivered before the waiter
/// parks is not lost; the waiter drains the counter after waking.
#[derive(Debug)]
pub struct WakeupChannel {
    fd: RawFd,
}

impl WakeupChannel {
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Makes the channel signaled. Safe to call from any thread, including
    /// when no thread is currently waiting.
    pub fn signal(&self) -> io::Result<()> {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, which still reads as
        // signaled on the waiter side.
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Resets the counter after a wake so the next wait parks again.
    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_idempotent_and_drain_resets() {
        let channel = WakeupChannel::create().unwrap();
        channel.signal().unwrap();
        channel.signal().unwrap();

        let mut value: u64 = 0;
        let rc = unsafe {
            libc::read(
                channel.raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(rc, 8);
        assert_eq!(value, 2);

        // Drained channel reads as empty again.
        let rc = unsafe {
            libc::read(
                channel.raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(rc, -1);
    }
}
