// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request lifecycle and flow control engine for a 16550-style serial port.
//!
//! A [`SerialDevice`] owns one UART (through [`UartRegisters`]) and the
//! per-class request queues in front of it. Requests enter through
//! [`SerialDevice::submit`], pass the PnP admission gate, and are either
//! finished immediately or queued behind the current request of their class.
//!
//! Two locks serialize the device. The cancel lock protects the queues, the
//! current slots and request locations. The hardware lock protects register
//! access and everything the interrupt paths touch. The cancel lock may be
//! taken first and the hardware lock inside it, never the reverse. Anything
//! the interrupt paths need done under the cancel lock is deferred to a DPC
//! and run by [`SerialDevice::run_deferred`].

#![warn(missing_docs)]

pub mod admission;
pub mod config;
pub mod deferred;
mod dispatch;
pub mod error_log;
mod flow;
mod hw;
mod isr;
mod lifecycle;
pub mod protocol;
pub mod request;
mod transfer;

pub use hw::Stats;

use crate::admission::PnpState;
use crate::config::ConfigError;
use crate::config::SerialConfig;
use crate::config::Timeouts;
use crate::deferred::DeferredWork;
use crate::deferred::Dpc;
use crate::deferred::QuiescentCounter;
use crate::deferred::Routine;
use crate::deferred::SystemTimeSource;
use crate::deferred::TimeSource;
use crate::deferred::Timer;
use crate::error_log::ErrorLogSink;
use crate::error_log::NoPnp;
use crate::error_log::PnpNotify;
use crate::error_log::TracingErrorLog;
use crate::hw::Hw;
use crate::hw::HwState;
use crate::lifecycle::CancelState;
use crate::protocol::CommStatus;
use crate::request::OpClass;
use crate::request::Request;
use parking_lot::Mutex;
use serial_core::UartRegisters;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// The collaborators a device reports to and takes time from.
pub struct Collaborators {
    /// Clock for read, write and RTS timers.
    pub time: Box<dyn TimeSource>,
    /// Receives diagnostic records.
    pub error_log: Box<dyn ErrorLogSink>,
    /// Told when the device declares its hardware broken.
    pub pnp: Box<dyn PnpNotify>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            time: Box::new(SystemTimeSource),
            error_log: Box::new(TracingErrorLog),
            pnp: Box::new(NoPnp),
        }
    }
}

/// A serial port. Clones share the same device.
#[derive(Clone)]
pub struct SerialDevice {
    pub(crate) inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    pub name: String,
    hw: Mutex<HwState>,
    pub cancel: Mutex<CancelState>,
    pub timeouts: Mutex<Timeouts>,
    pub pnp_state: Mutex<PnpState>,
    pub deferred: DeferredWork,
    pub pending_requests: QuiescentCounter,
    pub lower_rts_attempts: AtomicI32,
    /// Write-class requests waiting behind the current one.
    pub queued_writes: AtomicUsize,
    pub error_log: Box<dyn ErrorLogSink>,
    pub pnp: Box<dyn PnpNotify>,
}

impl SerialDevice {
    /// Creates a device over `regs`. The device starts closed, accepting
    /// requests.
    pub fn new(
        config: SerialConfig,
        regs: Box<dyn UartRegisters>,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::debug!(
            port = %config.name,
            buffer_size = config.buffer_size,
            "creating serial device"
        );
        let Collaborators {
            time,
            error_log,
            pnp,
        } = collaborators;
        Ok(Self {
            inner: Arc::new(DeviceInner {
                hw: Mutex::new(HwState::new(&config, regs)),
                cancel: Mutex::new(CancelState::new(time.now())),
                timeouts: Mutex::new(config.timeouts),
                pnp_state: Mutex::new(PnpState::default()),
                deferred: DeferredWork::new(time),
                pending_requests: QuiescentCounter::new("pending_requests"),
                lower_rts_attempts: AtomicI32::new(0),
                queued_writes: AtomicUsize::new(0),
                error_log,
                pnp,
                name: config.name,
            }),
        })
    }

    /// The device name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Opens the port: clears stale state and applies the whole flow control
    /// policy.
    pub fn open(&self) {
        self.inner.synchronize(|hw| {
            hw.interrupt_buffer.clear();
            hw.rx_holding = Default::default();
            hw.tx_holding = Default::default();
            hw.error_word = Default::default();
            hw.isr_wait_mask = Default::default();
            hw.history_mask = Default::default();
            hw.send_xon_char = false;
            hw.send_xoff_char = false;
            hw.device_is_opened = false;
            let hand_flow = hw.hand_flow;
            hw.set_hand_flow(&hand_flow);
            hw.device_is_opened = true;
        });
        tracing::debug!(port = %self.name(), "opened");
    }

    /// Closes the port: cancels outstanding transfers and waits, stops any
    /// break and drops DTR and RTS.
    pub fn close(&self) {
        for class in [
            OpClass::Immediate,
            OpClass::Write,
            OpClass::Read,
            OpClass::Mask,
            OpClass::Wait,
        ] {
            self.inner.kill_all_reads_or_writes(class);
        }
        self.inner.synchronize(|hw| {
            hw.turn_off_break();
            hw.isr_wait_mask = Default::default();
            hw.history_mask = Default::default();
            hw.clr_dtr();
            hw.clr_rts();
            hw.device_is_opened = false;
        });
        tracing::debug!(port = %self.name(), "closed");
    }

    /// Cancels `request` wherever it is. Has no effect on a request that has
    /// already completed.
    pub fn cancel(&self, request: &Request) {
        self.inner.cancel_request(request);
    }

    /// The receive interrupt: `ch` arrived on the wire.
    pub fn isr_receive(&self, ch: u8) {
        self.inner.synchronize(|hw| hw.receive_char(ch));
    }

    /// The transmit holding register empty interrupt.
    pub fn isr_transmit_ready(&self) {
        self.inner.synchronize(|hw| hw.transmit_ready());
    }

    /// The modem status interrupt.
    pub fn isr_modem_status(&self) {
        self.inner.synchronize(|hw| hw.modem_status());
    }

    /// The line status interrupt.
    pub fn isr_line_status(&self) {
        self.inner.synchronize(|hw| hw.line_status());
    }

    /// Runs every DPC and expired timer that is ready, including ones that
    /// become ready while running. Returns how many routines ran.
    pub fn run_deferred(&self) -> usize {
        let mut count = 0;
        while let Some(routine) = self.inner.deferred.next_ready() {
            tracing::trace!(port = %self.name(), ?routine, "running deferred routine");
            self.inner.run_routine(routine);
            self.inner.deferred.dpc_epilogue();
            count += 1;
        }
        count
    }

    /// Blocks until no request is in flight and no deferred work is
    /// outstanding, or until `deadline`. Returns false on timeout.
    #[must_use]
    pub fn wait_for_quiescence(&self, deadline: Instant) -> bool {
        self.inner.pending_requests.wait_zero_deadline(deadline)
            && self.inner.deferred.outstanding().wait_zero_deadline(deadline)
    }

    /// Completes when no request is in flight and no deferred work is
    /// outstanding.
    pub async fn quiesced(&self) {
        self.inner.pending_requests.wait_zero().await;
        self.inner.deferred.outstanding().wait_zero().await;
    }

    /// Requests admitted and not yet completed.
    pub fn pending_requests(&self) -> isize {
        self.inner.pending_requests.get()
    }

    /// DPCs queued plus timers armed.
    pub fn outstanding_deferred(&self) -> isize {
        self.inner.deferred.outstanding().get()
    }

    /// RTS lowering attempts not yet settled.
    pub fn lower_rts_attempts(&self) -> i32 {
        self.inner.lower_rts_attempts.load(Ordering::Acquire)
    }

    /// Snapshot of the line and queues. Clears the latched errors, as a
    /// status query request would.
    pub fn comm_status(&self) -> CommStatus {
        self.inner.get_comm_status()
    }

    /// Transfer counters.
    pub fn stats(&self) -> Stats {
        self.inner.synchronize(|hw| hw.stats)
    }
}

impl DeviceInner {
    /// Runs `f` with the hardware lock held.
    pub(crate) fn synchronize<R>(&self, f: impl FnOnce(&mut Hw<'_>) -> R) -> R {
        let mut hw = Hw::new(self.hw.lock(), self);
        f(&mut hw)
    }

    fn run_routine(&self, routine: Routine) {
        match routine {
            Routine::Dpc(Dpc::CompleteRead) => self.complete_read(),
            Routine::Dpc(Dpc::CompleteWrite) => self.complete_write(),
            Routine::Dpc(Dpc::CompleteImmediate) => self.complete_immediate(),
            Routine::Dpc(Dpc::CommWait) => self.complete_wait(),
            Routine::Dpc(Dpc::CommError) => self.comm_error(),
            Routine::Dpc(Dpc::LogLineErrors) => self.log_line_errors(),
            Routine::Dpc(Dpc::StartTimerLowerRts) => self.start_timer_lower_rts(),
            Routine::Timer(Timer::ReadTotal) => self.read_total_timeout(),
            Routine::Timer(Timer::ReadInterval) => self.read_interval_timeout(),
            Routine::Timer(Timer::WriteTotal) => self.write_total_timeout(),
            Routine::Timer(Timer::ImmediateTotal) => self.immediate_total_timeout(),
            Routine::Timer(Timer::LowerRts) => self.invoke_perhaps_lower_rts(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use crate::config::SerialConfig;
    use crate::deferred::MockTimeSource;
    use crate::error_log::MemoryErrorLog;
    use crate::Collaborators;
    use crate::SerialDevice;
    use serial_core::sim::simulated_uart;
    use serial_core::sim::SimulatedUartControl;

    pub use test_with_tracing::init as test_init;

    pub fn device_with(
        config: SerialConfig,
        time: MockTimeSource,
    ) -> (SerialDevice, SimulatedUartControl, MockTimeSource) {
        let (device, uart, time, _log) = device_with_log(config, time);
        (device, uart, time)
    }

    pub fn device_with_log(
        config: SerialConfig,
        time: MockTimeSource,
    ) -> (SerialDevice, SimulatedUartControl, MockTimeSource, MemoryErrorLog) {
        let (uart, control) = simulated_uart();
        let log = MemoryErrorLog::default();
        let device = SerialDevice::new(
            config,
            Box::new(uart),
            Collaborators {
                time: Box::new(time.clone()),
                error_log: Box::new(log.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        (device, control, time, log)
    }
}
