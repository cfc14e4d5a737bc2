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

use bitflags::bitflags;

bitflags! {
    /// Modem control line states reported by the event looper.
    ///
    /// The encoding is fixed and identical on every platform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineEvents: u8 {
        /// Clear To Send.
        const CTS = 0b0000_0001;
        /// Data Set Ready.
        const DSR = 0b0000_0010;
        /// Data Carrier Detect.
        const DCD = 0b0000_0100;
        /// Ring Indicator.
        const RING = 0b0000_1000;
    }
}

/// Callback target for data and line-event delivery.
///
/// All methods are invoked from the looper threads belonging to the handle
/// the consumer was registered for. They must be bounded, non-blocking
/// operations and must not call back into
/// [`LooperCoordinator`](crate::LooperCoordinator), because unregistration
/// joins the calling thread and would deadlock.
pub trait SerialEventConsumer: Send + Sync {
    /// Delivers one contiguous chunk of bytes read from the device. Called at
    /// most once per wake cycle of the data looper.
    fn on_data(&self, data: &[u8]);

    /// Reports a hard read error (raw OS error code, or -1 when unknown).
    /// The data looper keeps running after this call; sustained error
    /// conditions are rate-limited before being re-reported.
    fn on_data_error(&self, code: i32) {
        let _ = code;
    }

    /// Reports the new combined line state after a modem control line
    /// transition. Called once per observed change, never once per line.
    fn on_event(&self, events: LineEvents) {
        let _ = events;
    }
}
