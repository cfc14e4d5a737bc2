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

//! Interactive demo: opens a serial device, registers both listeners and
//! prints traffic and modem line transitions until Enter is pressed.
//!
//! The device-open code below stands in for the port-open component the
//! library deliberately does not contain.

#[cfg(unix)]
mod unix_console {
    use std::ffi::CString;
    use std::io::{self, BufRead};
    use std::sync::Arc;

    use serial_looper::{
        DevicePort, LineEvents, LooperCoordinator, RawDeviceHandle, SerialEventConsumer,
    };

    struct UnixSerialPort {
        fd: RawDeviceHandle,
    }

    impl UnixSerialPort {
        fn open(path: &str) -> io::Result<Self> {
            let c_path = CString::new(path)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
            let fd = unsafe {
                libc::open(
                    c_path.as_ptr(),
                    libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    impl DevicePort for UnixSerialPort {
        fn raw_handle(&self) -> RawDeviceHandle {
            self.fd
        }

        fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
            let rc = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(rc as usize)
        }

        fn line_status(&self) -> io::Result<LineEvents> {
            let mut bits: libc::c_int = 0;
            if unsafe { libc::ioctl(self.fd, libc::TIOCMGET, &mut bits) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut status = LineEvents::empty();
            if bits & libc::TIOCM_CTS != 0 {
                status |= LineEvents::CTS;
            }
            if bits & libc::TIOCM_DSR != 0 {
                status |= LineEvents::DSR;
            }
            if bits & libc::TIOCM_CAR != 0 {
                status |= LineEvents::DCD;
            }
            if bits & libc::TIOCM_RNG != 0 {
                status |= LineEvents::RING;
            }
            Ok(status)
        }
    }

    impl Drop for UnixSerialPort {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    struct PrintingConsumer;

    impl SerialEventConsumer for PrintingConsumer {
        fn on_data(&self, data: &[u8]) {
            match std::str::from_utf8(data) {
                Ok(text) => print!("{}", text),
                Err(_) => println!("{} bytes: {:02x?}", data.len(), data),
            }
        }

        fn on_data_error(&self, code: i32) {
            eprintln!("read error (os code {})", code);
        }

        fn on_event(&self, events: LineEvents) {
            println!("line state changed: {:?}", events);
        }
    }

    pub fn run() -> Result<(), String> {
        let path = std::env::args()
            .nth(1)
            .ok_or("usage: console <serial device path>")?;

        let port = Arc::new(
            UnixSerialPort::open(&path).map_err(|e| format!("failed to open {}: {}", path, e))?,
        );
        let handle = port.raw_handle();
        let consumer = Arc::new(PrintingConsumer);

        let coordinator = LooperCoordinator::new();
        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .map_err(|e| e.to_string())?;
        coordinator
            .register_event_listener(port.clone(), consumer)
            .map_err(|e| e.to_string())?;

        println!("listening on {}, press Enter to exit", path);
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);

        coordinator
            .unregister_data_listener(handle)
            .map_err(|e| e.to_string())?;
        coordinator
            .unregister_event_listener(handle)
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(unix)]
fn main() -> Result<(), String> {
    env_logger::init();
    unix_console::run()
}

#[cfg(not(unix))]
fn main() {
    eprintln!("the console demo currently supports Unix targets only");
}
