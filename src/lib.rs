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

//! Per-handle looper subsystem for already-opened serial devices.
//!
//! The crate owns two kinds of long-lived worker threads per registered
//! device handle: a data looper that blocks until the device becomes readable
//! and forwards drained bytes to a [`SerialEventConsumer`], and an event
//! looper that reports modem control line (CTS/DSR/DCD/RING) transitions.
//! Registration and synchronous teardown go through [`LooperCoordinator`];
//! cancellation of a blocked looper is done through a per-worker wakeup
//! channel, never by killing the thread.
//!
//! Opening and configuring the device is not this crate's job: callers hand
//! in anything implementing [`DevicePort`] over an already-opened handle.

pub mod consumer;
pub mod error;
pub mod platform;
pub mod port;

mod coordinator;
mod looper;
mod registry;

pub use consumer::{LineEvents, SerialEventConsumer};
pub use coordinator::LooperCoordinator;
pub use error::LooperError;
pub use platform::RawDeviceHandle;
pub use port::DevicePort;
