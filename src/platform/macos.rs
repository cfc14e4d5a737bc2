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

/// Wakeup channel backed by a self-pipe (macOS has no eventfd).
///
/// A signal writes one byte to the write end; the waiter polls the read end
/// and drains it after waking. A signal delivered before the waiter parks
/// stays pending in the pipe buffer.
#[derive(Debug)]
pub struct WakeupChannel {
    read_fd: RawFd,
    write_fd: RawFd,
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl WakeupChannel {
    pub fn create() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let channel = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblocking_cloexec(channel.read_fd)?;
        set_nonblocking_cloexec(channel.write_fd)?;
        Ok(channel)
    }

    /// Makes the channel signaled. Safe to call from any thread, including
    /// when no thread is currently waiting.
    pub fn signal(&self) -> io::Result<()> {
        let byte = 1u8;
        let rc = unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1)
        };
        // A full pipe buffer already guarantees the waiter will see POLLIN.
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Empties the pipe after a wake so the next wait parks again.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
