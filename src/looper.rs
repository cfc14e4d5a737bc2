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

//! The looper thread bodies. Each looper moves through
//! `Initializing -> Running -> Exiting -> Terminated`; initialization
//! failures are reported through the [`InitGate`] and skip `Running`
//! entirely, so the registering thread never records a dead worker as alive.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::consumer::{LineEvents, SerialEventConsumer};
use crate::platform::{self, TickOutcome, WaitOutcome, WakeupChannel};
use crate::port::DevicePort;

/// Staging buffer for one drain pass over the device.
const STAGING_BUFFER_LEN: usize = 3072;

/// Sustained error conditions re-notify the consumer only on the 1st and
/// every `ERROR_NOTIFY_PERIOD`-th consecutive occurrence, so a removed device
/// does not flood the callback boundary.
const ERROR_NOTIFY_PERIOD: u32 = 100;

/// How often the event looper re-derives the line state while idle.
pub(crate) const LINE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Synchronization cell the registering thread blocks on until the spawned
/// looper reports whether its initialization succeeded.
pub(crate) struct InitGate {
    result: Mutex<Option<Result<(), String>>>,
    ready: Condvar,
}

impl InitGate {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Called exactly once by the looper thread at the end of `Initializing`.
    pub fn complete(&self, result: Result<(), String>) {
        let mut cell = self.result.lock().unwrap();
        *cell = Some(result);
        self.ready.notify_all();
    }

    /// Blocks until the looper reported its initialization outcome.
    pub fn wait(&self) -> Result<(), String> {
        let mut cell = self.result.lock().unwrap();
        loop {
            if let Some(result) = cell.take() {
                return result;
            }
            cell = self.ready.wait(cell).unwrap();
        }
    }
}

/// Everything a looper thread needs; clones of the `Arc`s stay owned by the
/// thread until it terminates.
pub(crate) struct LooperContext {
    pub port: Arc<dyn DevicePort>,
    pub consumer: Arc<dyn SerialEventConsumer>,
    pub exit_requested: Arc<AtomicBool>,
    pub wakeup: Arc<WakeupChannel>,
    pub init: Arc<InitGate>,
}

fn error_code(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(-1)
}

/// Data looper thread body: wait for readability, drain, deliver.
pub(crate) fn run_data_looper(ctx: LooperContext) {
    let handle = ctx.port.raw_handle();

    // Initializing
    let mut waiter = match platform::DataWaiter::new(handle, ctx.wakeup.clone()) {
        Ok(waiter) => waiter,
        Err(error) => {
            ctx.init
                .complete(Err(format!("wait primitive setup failed: {}", error)));
            return;
        }
    };
    ctx.init.complete(Ok(()));
    debug!("data looper for handle {} running", handle);

    // Running
    let mut staging = vec![0u8; STAGING_BUFFER_LEN];
    let mut chunk: Vec<u8> = Vec::new();
    let mut errors_in_row: u32 = 0;
    loop {
        match waiter.wait() {
            Ok(WaitOutcome::Wakeup) => {
                if ctx.exit_requested.load(Ordering::Acquire) {
                    break;
                }
                // Not an exit request, merely a nudge; park again.
            }
            Ok(WaitOutcome::Readable) => {
                drain_device(&ctx, &mut staging, &mut chunk, &mut errors_in_row);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                report_read_error(&ctx, &error, &mut errors_in_row);
                if ctx.exit_requested.load(Ordering::Acquire) {
                    break;
                }
                // A wait primitive that keeps failing must not spin hot.
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    // Exiting: waiter, wakeup channel and consumer reference are released
    // with this frame.
    debug!("data looper for handle {} terminated", handle);
}

/// Reads everything currently available into one contiguous chunk and
/// delivers it with a single `on_data` call. Interrupted reads are retried
/// within the same wake cycle so a split payload is still one delivery.
fn drain_device(
    ctx: &LooperContext,
    staging: &mut [u8],
    chunk: &mut Vec<u8>,
    errors_in_row: &mut u32,
) {
    chunk.clear();
    loop {
        match ctx.port.read_bytes(staging) {
            Ok(0) => break,
            Ok(count) => chunk.extend_from_slice(&staging[..count]),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
            Err(error) => {
                report_read_error(ctx, &error, errors_in_row);
                break;
            }
        }
    }
    if !chunk.is_empty() {
        *errors_in_row = 0;
        ctx.consumer.on_data(chunk);
    }
    // An empty chunk with no error is a spurious wake; nothing to deliver.
}

fn report_read_error(ctx: &LooperContext, error: &io::Error, errors_in_row: &mut u32) {
    *errors_in_row = errors_in_row.saturating_add(1);
    if *errors_in_row % ERROR_NOTIFY_PERIOD == 1 {
        warn!(
            "read error on handle {} (occurrence {}): {}",
            ctx.port.raw_handle(),
            errors_in_row,
            error
        );
        ctx.consumer.on_data_error(error_code(error));
    }
}

/// Event looper thread body: re-derive the line state on a cancellable tick
/// and notify only actual changes against the last notified bitmask.
pub(crate) fn run_event_looper(ctx: LooperContext) {
    let handle = ctx.port.raw_handle();

    // Initializing: the baseline snapshot doubles as a probe that the port
    // supports status queries at all.
    let mut last_notified: LineEvents = match ctx.port.line_status() {
        Ok(status) => status,
        Err(error) => {
            ctx.init
                .complete(Err(format!("initial line status query failed: {}", error)));
            return;
        }
    };
    ctx.init.complete(Ok(()));
    debug!(
        "event looper for handle {} running, baseline {:?}",
        handle, last_notified
    );

    // Running
    let mut errors_in_row: u32 = 0;
    loop {
        match platform::wait_wakeup_or_timeout(&ctx.wakeup, LINE_POLL_INTERVAL) {
            Ok(TickOutcome::Wakeup) => {
                if ctx.exit_requested.load(Ordering::Acquire) {
                    break;
                }
            }
            Ok(TickOutcome::Elapsed) => match ctx.port.line_status() {
                Ok(status) => {
                    errors_in_row = 0;
                    if status != last_notified {
                        last_notified = status;
                        ctx.consumer.on_event(status);
                    }
                }
                Err(error) => {
                    errors_in_row = errors_in_row.saturating_add(1);
                    if errors_in_row % ERROR_NOTIFY_PERIOD == 1 {
                        warn!(
                            "line status query failed on handle {} (occurrence {}): {}",
                            handle, errors_in_row, error
                        );
                    }
                }
            },
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                warn!("event wait failed on handle {}: {}", handle, error);
                if ctx.exit_requested.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    debug!("event looper for handle {} terminated", handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn init_gate_returns_result_posted_before_wait() {
        let gate = InitGate::new();
        gate.complete(Err("boom".to_string()));
        assert_eq!(gate.wait(), Err("boom".to_string()));
    }

    #[test]
    fn init_gate_unblocks_a_parked_waiter() {
        let gate = Arc::new(InitGate::new());
        let completer = gate.clone();
        let start = Instant::now();
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            completer.complete(Ok(()));
        });
        assert_eq!(gate.wait(), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(40));
        poster.join().unwrap();
    }
}
