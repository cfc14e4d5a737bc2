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

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;

use crate::error::LooperError;
use crate::platform::{RawDeviceHandle, WakeupChannel};

/// Default bound on concurrently registered device handles.
pub(crate) const DEFAULT_CAPACITY: usize = 1024;

/// One running looper thread and the pieces used to cancel it.
///
/// The thread itself owns clones of `exit_requested` and `wakeup` (plus the
/// consumer reference), so dropping a `Worker` after join releases the
/// wakeup channel exactly when the last user is gone.
pub(crate) struct Worker {
    pub thread: JoinHandle<()>,
    pub exit_requested: Arc<AtomicBool>,
    pub wakeup: Arc<WakeupChannel>,
}

/// Which looper role a registration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Data,
    Event,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Data => "data",
            Role::Event => "event",
        }
    }
}

/// All worker state for one registered device handle.
pub(crate) struct WorkerSlot {
    pub handle: RawDeviceHandle,
    pub data: Option<Worker>,
    pub event: Option<Worker>,
}

impl WorkerSlot {
    fn new(handle: RawDeviceHandle) -> Self {
        Self {
            handle,
            data: None,
            event: None,
        }
    }

    pub fn worker(&self, role: Role) -> &Option<Worker> {
        match role {
            Role::Data => &self.data,
            Role::Event => &self.event,
        }
    }

    pub fn worker_mut(&mut self, role: Role) -> &mut Option<Worker> {
        match role {
            Role::Data => &mut self.data,
            Role::Event => &mut self.event,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.event.is_none()
    }
}

/// Fixed-capacity table mapping device handles to worker slots.
///
/// The registry itself is not synchronized; the coordinator serializes all
/// access through one mutex. Looper threads never touch it.
pub(crate) struct HandleRegistry {
    slots: Vec<Option<WorkerSlot>>,
}

impl HandleRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot currently serving `handle`, if any.
    pub fn find(&self, handle: RawDeviceHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.handle == handle))
    }

    /// Returns the slot for `handle`, claiming a free slot when the handle is
    /// not yet tracked. A handle never occupies more than one slot.
    pub fn find_or_create(&mut self, handle: RawDeviceHandle) -> Result<usize, LooperError> {
        if let Some(index) = self.find(handle) {
            return Ok(index);
        }
        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(LooperError::ResourceExhausted(self.slots.len()))?;
        self.slots[free] = Some(WorkerSlot::new(handle));
        Ok(free)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Frees a slot. Calling this while either worker is still recorded is a
    /// programming error: fatal in debug builds, reported in release builds.
    pub fn release(&mut self, index: usize) -> Result<(), LooperError> {
        let occupied = match self.slots.get(index).and_then(Option::as_ref) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        if !occupied.is_empty() {
            error!(
                "refusing to release registry slot {} for handle {}: a worker is still recorded",
                index, occupied.handle
            );
            debug_assert!(false, "registry slot released while a worker is still recorded");
            return Err(LooperError::InvariantViolation(
                "slot released while a worker is still recorded",
            ));
        }
        self.slots[index] = None;
        Ok(())
    }

    /// Number of handles currently tracked.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
