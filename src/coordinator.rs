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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, info};

use crate::consumer::SerialEventConsumer;
use crate::error::LooperError;
use crate::looper::{run_data_looper, run_event_looper, InitGate, LooperContext};
use crate::platform::{RawDeviceHandle, WakeupChannel};
use crate::registry::{HandleRegistry, Role, Worker, DEFAULT_CAPACITY};
use crate::port::DevicePort;

/// Owner of the handle registry and of every looper thread spawned for it.
///
/// Registration and unregistration are rare, caller-driven operations, so all
/// registry access is serialized by one mutex; looper threads never take it.
/// `unregister_*` is synchronous by design: once it returns `Ok`, the looper
/// thread has been joined and no further consumer callback for that role will
/// occur. For the same reason, consumer callbacks must not call back into the
/// coordinator.
///
/// Dropping the coordinator does not force-unregister anything; callers must
/// unregister every listener first, as the loopers borrow device handles the
/// coordinator does not own.
pub struct LooperCoordinator {
    registry: Mutex<HandleRegistry>,
}

impl LooperCoordinator {
    /// Creates a coordinator bounded to 1024 concurrently registered handles.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a coordinator bounded to `capacity` concurrently registered
    /// handles.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(HandleRegistry::new(capacity)),
        }
    }

    /// Starts a data looper for the port and delivers drained bytes to
    /// `consumer` until the listener is unregistered.
    ///
    /// Fails with [`LooperError::AlreadyRegistered`] when a data listener
    /// already exists for this handle. On any failure the registry is left
    /// exactly as it was before the call.
    pub fn register_data_listener(
        &self,
        port: Arc<dyn DevicePort>,
        consumer: Arc<dyn SerialEventConsumer>,
    ) -> Result<(), LooperError> {
        self.register(Role::Data, port, consumer)
    }

    /// Stops the data looper for `handle` and waits for its termination.
    pub fn unregister_data_listener(&self, handle: RawDeviceHandle) -> Result<(), LooperError> {
        self.unregister(Role::Data, handle)
    }

    /// Starts an event looper reporting modem line transitions for the port.
    /// Same contract as [`register_data_listener`](Self::register_data_listener).
    pub fn register_event_listener(
        &self,
        port: Arc<dyn DevicePort>,
        consumer: Arc<dyn SerialEventConsumer>,
    ) -> Result<(), LooperError> {
        self.register(Role::Event, port, consumer)
    }

    /// Stops the event looper for `handle` and waits for its termination.
    pub fn unregister_event_listener(&self, handle: RawDeviceHandle) -> Result<(), LooperError> {
        self.unregister(Role::Event, handle)
    }

    /// Number of handles with at least one registered listener.
    pub fn registered_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    fn register(
        &self,
        role: Role,
        port: Arc<dyn DevicePort>,
        consumer: Arc<dyn SerialEventConsumer>,
    ) -> Result<(), LooperError> {
        let handle = port.raw_handle();
        let mut registry = self.registry.lock().unwrap();

        let index = registry.find_or_create(handle)?;
        let slot = registry
            .slot_mut(index)
            .expect("freshly claimed slot is occupied");
        if slot.worker(role).is_some() {
            // find_or_create cannot have claimed a fresh slot here: a fresh
            // slot has no workers.
            return Err(LooperError::AlreadyRegistered);
        }

        let wakeup = match WakeupChannel::create() {
            Ok(channel) => Arc::new(channel),
            Err(error) => {
                release_if_empty(&mut registry, index);
                return Err(LooperError::SpawnFailed(format!(
                    "wakeup channel allocation failed: {}",
                    error
                )));
            }
        };
        let exit_requested = Arc::new(AtomicBool::new(false));
        let init = Arc::new(InitGate::new());
        let context = LooperContext {
            port,
            consumer,
            exit_requested: exit_requested.clone(),
            wakeup: wakeup.clone(),
            init: init.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("serial-{}-looper-{}", role.as_str(), handle))
            .spawn(move || match role {
                Role::Data => run_data_looper(context),
                Role::Event => run_event_looper(context),
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(error) => {
                release_if_empty(&mut registry, index);
                return Err(LooperError::SpawnFailed(format!(
                    "thread creation failed: {}",
                    error
                )));
            }
        };
        *slot_worker(&mut registry, index, role) = Some(Worker {
            thread,
            exit_requested,
            wakeup,
        });
        drop(registry);

        // The looper reports its Initializing outcome before entering the
        // wait loop; block the caller on it so spawn failures are synchronous.
        match init.wait() {
            Ok(()) => {
                info!("registered {} listener for handle {}", role.as_str(), handle);
                Ok(())
            }
            Err(reason) => {
                let mut registry = self.registry.lock().unwrap();
                if let Some(index) = registry.find(handle) {
                    if let Some(worker) = slot_worker(&mut registry, index, role).take() {
                        // The looper already terminated after reporting the
                        // failure; join reclaims the thread.
                        let _ = worker.thread.join();
                    }
                    release_if_empty(&mut registry, index);
                }
                Err(LooperError::SpawnFailed(reason))
            }
        }
    }

    fn unregister(&self, role: Role, handle: RawDeviceHandle) -> Result<(), LooperError> {
        // The lock is held across signal + join + release on purpose: loopers
        // never take it, and holding it guarantees a concurrent register for
        // the same role cannot observe a half-torn-down slot.
        let mut registry = self.registry.lock().unwrap();
        let index = registry.find(handle).ok_or(LooperError::NotRegistered)?;
        let worker = slot_worker(&mut registry, index, role)
            .take()
            .ok_or(LooperError::NotRegistered)?;

        worker.exit_requested.store(true, Ordering::Release);
        if let Err(error) = worker.wakeup.signal() {
            // Without the wakeup the looper may stay parked forever; put the
            // worker back so the caller can retry instead of leaking it.
            *slot_worker(&mut registry, index, role) = Some(worker);
            return Err(LooperError::JoinFailed(format!(
                "failed to signal wakeup channel: {}",
                error
            )));
        }

        debug!(
            "waiting for {} looper of handle {} to terminate",
            role.as_str(),
            handle
        );
        let join_result = worker.thread.join();
        drop(worker.wakeup);
        release_if_empty(&mut registry, index);
        match join_result {
            Ok(()) => {
                info!(
                    "unregistered {} listener for handle {}",
                    role.as_str(),
                    handle
                );
                Ok(())
            }
            // A panicked looper has still terminated; the slot release above
            // is safe, but the failure must not be papered over.
            Err(_) => Err(LooperError::JoinFailed(
                "looper thread panicked".to_string(),
            )),
        }
    }
}

impl Default for LooperCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_worker<'a>(
    registry: &'a mut MutexGuard<'_, HandleRegistry>,
    index: usize,
    role: Role,
) -> &'a mut Option<Worker> {
    registry
        .slot_mut(index)
        .expect("slot occupied while a registration references it")
        .worker_mut(role)
}

fn release_if_empty(registry: &mut MutexGuard<'_, HandleRegistry>, index: usize) {
    let empty = registry
        .slot_mut(index)
        .map(|slot| slot.is_empty())
        .unwrap_or(false);
    if empty {
        let _ = registry.release(index);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::consumer::LineEvents;
    use crate::looper::LINE_POLL_INTERVAL;
    use std::collections::VecDeque;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::time::{Duration, Instant};

    /// Scripted read outcomes returned ahead of the doorbell pipe contents.
    enum ReadStep {
        Bytes(Vec<u8>),
        Interrupted,
        Fail(i32),
    }

    /// Pipe-backed synthetic device: the pipe provides a real waitable fd and
    /// doubles as the data source when no script is queued.
    struct MockPort {
        read_fd: RawFd,
        write_fd: RawFd,
        script: Mutex<VecDeque<ReadStep>>,
        status: Mutex<LineEvents>,
    }

    impl MockPort {
        fn new() -> Arc<Self> {
            let mut fds = [0 as RawFd; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            for fd in fds {
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    assert!(flags >= 0);
                    assert!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0);
                }
            }
            Arc::new(Self {
                read_fd: fds[0],
                write_fd: fds[1],
                script: Mutex::new(VecDeque::new()),
                status: Mutex::new(LineEvents::empty()),
            })
        }

        fn push_script(&self, steps: impl IntoIterator<Item = ReadStep>) {
            self.script.lock().unwrap().extend(steps);
        }

        /// Writes bytes into the pipe, making the port readable.
        fn inject(&self, bytes: &[u8]) -> usize {
            let rc = unsafe {
                libc::write(
                    self.write_fd,
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            if rc < 0 {
                0
            } else {
                rc as usize
            }
        }

        fn set_status(&self, status: LineEvents) {
            *self.status.lock().unwrap() = status;
        }
    }

    impl DevicePort for MockPort {
        fn raw_handle(&self) -> RawDeviceHandle {
            self.read_fd
        }

        fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(step) = self.script.lock().unwrap().pop_front() {
                return match step {
                    ReadStep::Bytes(bytes) => {
                        let count = bytes.len().min(buf.len());
                        buf[..count].copy_from_slice(&bytes[..count]);
                        Ok(count)
                    }
                    ReadStep::Interrupted => Err(io::Error::from(io::ErrorKind::Interrupted)),
                    ReadStep::Fail(code) => Err(io::Error::from_raw_os_error(code)),
                };
            }
            let rc = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(rc as usize)
        }

        fn line_status(&self) -> io::Result<LineEvents> {
            Ok(*self.status.lock().unwrap())
        }
    }

    impl Drop for MockPort {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }

    #[derive(Default)]
    struct RecordingConsumer {
        data: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<i32>>,
        events: Mutex<Vec<LineEvents>>,
    }

    impl RecordingConsumer {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn data_calls(&self) -> Vec<Vec<u8>> {
            self.data.lock().unwrap().clone()
        }

        fn error_calls(&self) -> Vec<i32> {
            self.errors.lock().unwrap().clone()
        }

        fn event_calls(&self) -> Vec<LineEvents> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SerialEventConsumer for RecordingConsumer {
        fn on_data(&self, data: &[u8]) {
            self.data.lock().unwrap().push(data.to_vec());
        }

        fn on_data_error(&self, code: i32) {
            self.errors.lock().unwrap().push(code);
        }

        fn on_event(&self, events: LineEvents) {
            self.events.lock().unwrap().push(events);
        }
    }

    fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    const GENEROUS: Duration = Duration::from_secs(5);

    #[test]
    fn data_listener_delivers_injected_bytes() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .unwrap();
        port.inject(b"hello");
        assert!(wait_until(GENEROUS, || consumer.data_calls().len() == 1));
        assert_eq!(consumer.data_calls()[0], b"hello");

        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
        assert_eq!(coordinator.registered_count(), 0);
    }

    #[test]
    fn second_data_registration_for_same_handle_is_rejected() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .unwrap();
        match coordinator.register_data_listener(port.clone(), consumer.clone()) {
            Err(LooperError::AlreadyRegistered) => {}
            other => panic!("expected AlreadyRegistered, got {:?}", other),
        }

        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
    }

    #[test]
    fn unregister_without_registration_is_rejected() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        match coordinator.unregister_data_listener(port.raw_handle()) {
            Err(LooperError::NotRegistered) => {}
            other => panic!("expected NotRegistered, got {:?}", other),
        }

        // A registered data listener does not make the event role registered.
        coordinator
            .register_data_listener(port.clone(), consumer)
            .unwrap();
        match coordinator.unregister_event_listener(port.raw_handle()) {
            Err(LooperError::NotRegistered) => {}
            other => panic!("expected NotRegistered, got {:?}", other),
        }
        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
    }

    #[test]
    fn no_data_callback_after_unregister_returns() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .unwrap();

        let stop_pump = Arc::new(AtomicBool::new(false));
        let pump = {
            let port = port.clone();
            let stop = stop_pump.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    port.inject(b"spam");
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        assert!(wait_until(GENEROUS, || !consumer.data_calls().is_empty()));

        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
        let calls_at_return = consumer.data_calls().len();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(consumer.data_calls().len(), calls_at_return);

        stop_pump.store(true, Ordering::Release);
        pump.join().unwrap();
    }

    #[test]
    fn partial_reads_within_one_wake_are_one_delivery() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .unwrap();

        // First two reads of the wake cycle come from the script (a short
        // read followed by EINTR); the retry then drains the pipe payload.
        port.push_script([
            ReadStep::Bytes(b"hello ".to_vec()),
            ReadStep::Interrupted,
        ]);
        port.inject(b"world");

        assert!(wait_until(GENEROUS, || !consumer.data_calls().is_empty()));
        assert_eq!(consumer.data_calls(), vec![b"hello world".to_vec()]);

        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
    }

    #[test]
    fn hard_read_errors_are_throttled_and_do_not_stop_the_looper() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .unwrap();

        // 150 consecutive hard errors, then the pipe payload proves the
        // looper is still alive. Only the 1st and 101st are reported.
        port.push_script((0..150).map(|_| ReadStep::Fail(libc::EIO)));
        port.inject(b"!");

        assert!(wait_until(GENEROUS, || consumer.data_calls() == vec![b"!".to_vec()]));
        assert_eq!(consumer.error_calls(), vec![libc::EIO, libc::EIO]);

        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
    }

    #[test]
    fn unregister_unblocks_an_idle_looper_quickly() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer)
            .unwrap();

        // The device never becomes readable; only the wakeup channel can end
        // the wait.
        let start = Instant::now();
        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn line_changes_are_coalesced_against_last_notified_state() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_event_listener(port.clone(), consumer.clone())
            .unwrap();

        port.set_status(LineEvents::CTS);
        assert!(wait_until(GENEROUS, || consumer.event_calls().len() == 1));

        // Re-asserting the same state must not produce a second call.
        port.set_status(LineEvents::CTS);
        thread::sleep(LINE_POLL_INTERVAL * 3);
        assert_eq!(consumer.event_calls(), vec![LineEvents::CTS]);

        port.set_status(LineEvents::CTS | LineEvents::DSR);
        assert!(wait_until(GENEROUS, || consumer.event_calls().len() == 2));
        assert_eq!(
            consumer.event_calls()[1],
            LineEvents::CTS | LineEvents::DSR
        );

        coordinator.unregister_event_listener(port.raw_handle()).unwrap();
    }

    #[test]
    fn data_and_event_roles_are_independent() {
        let coordinator = LooperCoordinator::new();
        let port = MockPort::new();
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(port.clone(), consumer.clone())
            .unwrap();
        coordinator
            .register_event_listener(port.clone(), consumer.clone())
            .unwrap();
        assert_eq!(coordinator.registered_count(), 1);

        // Tearing down the data role leaves the event looper running.
        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
        assert_eq!(coordinator.registered_count(), 1);

        port.set_status(LineEvents::RING);
        assert!(wait_until(GENEROUS, || consumer.event_calls().len() == 1));
        assert_eq!(consumer.event_calls(), vec![LineEvents::RING]);

        coordinator.unregister_event_listener(port.raw_handle()).unwrap();
        assert_eq!(coordinator.registered_count(), 0);
    }

    #[test]
    fn capacity_exhaustion_reports_and_recovers() {
        let coordinator = LooperCoordinator::with_capacity(2);
        let ports = [MockPort::new(), MockPort::new(), MockPort::new()];
        let consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(ports[0].clone(), consumer.clone())
            .unwrap();
        coordinator
            .register_data_listener(ports[1].clone(), consumer.clone())
            .unwrap();
        match coordinator.register_data_listener(ports[2].clone(), consumer.clone()) {
            Err(LooperError::ResourceExhausted(2)) => {}
            other => panic!("expected ResourceExhausted(2), got {:?}", other),
        }

        // Existing registrations keep working after the failed attempt.
        ports[1].inject(b"still alive");
        assert!(wait_until(GENEROUS, || !consumer.data_calls().is_empty()));

        coordinator
            .unregister_data_listener(ports[0].raw_handle())
            .unwrap();
        coordinator
            .register_data_listener(ports[2].clone(), consumer.clone())
            .unwrap();

        coordinator
            .unregister_data_listener(ports[1].raw_handle())
            .unwrap();
        coordinator
            .unregister_data_listener(ports[2].raw_handle())
            .unwrap();
    }

    #[test]
    fn released_slot_is_reused_without_residual_delivery() {
        let coordinator = LooperCoordinator::with_capacity(1);
        let first_port = MockPort::new();
        let first_consumer = RecordingConsumer::new();

        coordinator
            .register_data_listener(first_port.clone(), first_consumer.clone())
            .unwrap();
        first_port.inject(b"old");
        assert!(wait_until(GENEROUS, || first_consumer.data_calls().len() == 1));
        coordinator
            .unregister_data_listener(first_port.raw_handle())
            .unwrap();

        // With capacity 1, the second port necessarily reuses the slot.
        let second_port = MockPort::new();
        let second_consumer = RecordingConsumer::new();
        coordinator
            .register_data_listener(second_port.clone(), second_consumer.clone())
            .unwrap();
        second_port.inject(b"new");
        assert!(wait_until(GENEROUS, || second_consumer.data_calls().len() == 1));
        assert_eq!(second_consumer.data_calls(), vec![b"new".to_vec()]);
        assert_eq!(first_consumer.data_calls(), vec![b"old".to_vec()]);

        coordinator
            .unregister_data_listener(second_port.raw_handle())
            .unwrap();
    }

    #[test]
    fn concurrent_registration_has_exactly_one_winner() {
        let coordinator = Arc::new(LooperCoordinator::new());
        let port = MockPort::new();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let port = port.clone();
                thread::spawn(move || {
                    coordinator.register_data_listener(port, RecordingConsumer::new())
                })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            match attempt.join().unwrap() {
                Ok(()) => winners += 1,
                Err(LooperError::AlreadyRegistered) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(winners, 1);

        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
    }

    #[test]
    fn failed_event_registration_leaves_registry_unchanged() {
        struct BrokenStatusPort {
            inner: Arc<MockPort>,
        }

        impl DevicePort for BrokenStatusPort {
            fn raw_handle(&self) -> RawDeviceHandle {
                self.inner.raw_handle()
            }
            fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
                self.inner.read_bytes(buf)
            }
            fn line_status(&self) -> io::Result<LineEvents> {
                Err(io::Error::from_raw_os_error(libc::ENOTTY))
            }
        }

        let coordinator = LooperCoordinator::new();
        let port = Arc::new(BrokenStatusPort {
            inner: MockPort::new(),
        });
        let consumer = RecordingConsumer::new();

        match coordinator.register_event_listener(port.clone(), consumer.clone()) {
            Err(LooperError::SpawnFailed(reason)) => {
                assert!(reason.contains("line status"));
            }
            other => panic!("expected SpawnFailed, got {:?}", other),
        }
        assert_eq!(coordinator.registered_count(), 0);

        // The handle is still usable for a working role afterwards.
        coordinator
            .register_data_listener(port.clone(), consumer)
            .unwrap();
        coordinator.unregister_data_listener(port.raw_handle()).unwrap();
    }
}
