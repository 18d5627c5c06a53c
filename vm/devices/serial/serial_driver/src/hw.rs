// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! State protected by the hardware lock, and the register-level primitives
//! that run under it.
//!
//! Everything reachable from [`Hw`] executes with the hardware lock held. It
//! must never block and never take the cancel lock; work that needs the
//! cancel lock is handed to a DPC instead.

use crate::config::HandFlow;
use crate::config::RtsControl;
use crate::config::SerialChars;
use crate::config::SerialConfig;
use crate::deferred::Dpc;
use crate::protocol::ErrorWord;
use crate::protocol::RxHolding;
use crate::protocol::TxHolding;
use crate::protocol::WaitMask;
use crate::request::Output;
use crate::request::Request;
use crate::DeviceInner;
use parking_lot::MutexGuard;
use serial_core::LineControlRegister;
use serial_core::LineStatusRegister;
use serial_core::UartRegisters;
use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A read the receive path is filling directly.
#[derive(Debug)]
pub(crate) struct IsrRead {
    pub request: Request,
    /// Total bytes the request wants, including any copied before the
    /// receive path took over.
    pub wanted: usize,
}

/// A write the transmit path is draining.
#[derive(Debug)]
pub(crate) struct IsrWrite {
    pub request: Request,
    pub sent: usize,
}

/// Transfer counters kept by the interrupt paths.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Bytes received, including ones handed straight to a read.
    pub received: u64,
    /// Bytes written to the transmit register, flow control bytes included.
    pub transmitted: u64,
    /// Bytes dropped because the interrupt buffer was full.
    pub buffer_overruns: u64,
}

pub(crate) struct HwState {
    pub regs: Box<dyn UartRegisters>,
    pub hand_flow: HandFlow,
    pub chars: SerialChars,
    pub baud_rate: u32,
    pub buffer_size: usize,
    pub interrupt_buffer: VecDeque<u8>,
    pub rx_holding: RxHolding,
    pub tx_holding: TxHolding,
    pub device_is_opened: bool,
    pub send_xon_char: bool,
    pub send_xoff_char: bool,
    /// The transmit holding register is empty and no interrupt is expected
    /// until more data is written.
    pub holding_empty: bool,
    pub emptied_transmit: bool,
    pub read: Option<IsrRead>,
    /// Bytes the receive path stored since the interval timer last looked.
    pub read_by_isr: usize,
    pub write: Option<IsrWrite>,
    /// An immediate character waiting for the transmitter. It goes out
    /// before the next byte of the current write.
    pub immediate: Option<Request>,
    pub error_word: ErrorWord,
    /// Line errors seen since the last diagnostic record was written.
    pub unlogged_errors: ErrorWord,
    pub isr_wait_mask: WaitMask,
    pub history_mask: WaitMask,
    /// The wait-on-mask request parked until an enabled event arrives.
    pub wait: Option<Request>,
    pub stats: Stats,
}

impl HwState {
    pub fn new(config: &SerialConfig, regs: Box<dyn UartRegisters>) -> Self {
        Self {
            regs,
            hand_flow: config.hand_flow,
            chars: config.chars,
            baud_rate: config.baud_rate,
            buffer_size: config.buffer_size,
            interrupt_buffer: VecDeque::with_capacity(config.buffer_size),
            rx_holding: RxHolding::new(),
            tx_holding: TxHolding::new(),
            device_is_opened: false,
            send_xon_char: false,
            send_xoff_char: false,
            holding_empty: true,
            emptied_transmit: false,
            read: None,
            read_by_isr: 0,
            write: None,
            immediate: None,
            error_word: ErrorWord::new(),
            unlogged_errors: ErrorWord::new(),
            isr_wait_mask: WaitMask::new(),
            history_mask: WaitMask::new(),
            wait: None,
            stats: Stats::default(),
        }
    }

    pub fn transmit_toggle(&self) -> bool {
        self.hand_flow.rts == RtsControl::TransmitToggle
    }

    /// The transmit path owns data it has not finished sending.
    pub fn write_pending(&self) -> bool {
        self.write.is_some() || self.immediate.is_some()
    }

    pub fn transmit_immediate(&self) -> bool {
        self.immediate.is_some()
    }

    /// The transmit path has a byte the current holding reasons let out.
    /// Only XOFF may hold back an immediate character.
    pub fn can_transmit(&self) -> bool {
        let tx_holding = self.tx_holding;
        (self.immediate.is_some() && (tx_holding.is_empty() || tx_holding.only_xoff()))
            || (self.write.is_some() && tx_holding.is_empty())
    }

    pub fn chars_in_interrupt_buffer(&self) -> usize {
        self.interrupt_buffer.len()
    }
}

/// Exclusive access to [`HwState`] plus the device-wide pieces that
/// hardware-lock code may touch (DPC queue, atomic counters).
pub(crate) struct Hw<'a> {
    state: MutexGuard<'a, HwState>,
    pub dev: &'a DeviceInner,
}

impl<'a> Hw<'a> {
    pub fn new(state: MutexGuard<'a, HwState>, dev: &'a DeviceInner) -> Self {
        Self { state, dev }
    }
}

impl Deref for Hw<'_> {
    type Target = HwState;

    fn deref(&self) -> &HwState {
        &self.state
    }
}

impl DerefMut for Hw<'_> {
    fn deref_mut(&mut self) -> &mut HwState {
        &mut self.state
    }
}

impl Hw<'_> {
    pub fn set_dtr(&mut self) {
        let mcr = self.regs.read_modem_control();
        tracing::debug!(port = %self.dev.name, "setting dtr");
        self.regs.write_modem_control(mcr.with_dtr(true));
    }

    pub fn clr_dtr(&mut self) {
        let mcr = self.regs.read_modem_control();
        tracing::debug!(port = %self.dev.name, "clearing dtr");
        self.regs.write_modem_control(mcr.with_dtr(false));
    }

    pub fn set_rts(&mut self) {
        let mcr = self.regs.read_modem_control();
        tracing::debug!(port = %self.dev.name, "setting rts");
        self.regs.write_modem_control(mcr.with_rts(true));
    }

    pub fn clr_rts(&mut self) {
        let mcr = self.regs.read_modem_control();
        tracing::debug!(port = %self.dev.name, "clearing rts");
        self.regs.write_modem_control(mcr.with_rts(false));
    }

    /// Makes the UART re-raise its pending interrupts.
    pub fn kick_interrupts(&mut self) {
        self.regs.kick_interrupts();
    }

    /// Provokes a transmit interrupt if output is waiting, nothing holds it
    /// and the holding register is idle.
    pub fn kick_if_transmit_pending(&mut self) {
        if self.holding_empty && self.can_transmit() {
            self.kick_interrupts();
        }
    }

    pub fn turn_on_break(&mut self) {
        if self.transmit_toggle() {
            self.set_rts();
        }
        let lcr = self.regs.read_line_control();
        self.regs.write_line_control(lcr.with_break_enabled(true));
        self.tx_holding.set_break_on(true);
        tracing::debug!(port = %self.dev.name, "break on");
    }

    pub fn turn_off_break(&mut self) {
        if !self.tx_holding.break_on() {
            return;
        }
        let lcr = self.regs.read_line_control();
        self.regs.write_line_control(lcr.with_break_enabled(false));
        self.tx_holding.set_break_on(false);
        tracing::debug!(port = %self.dev.name, "break off");
        if self.holding_empty && self.can_transmit() {
            self.kick_interrupts();
        } else {
            self.dev.lower_rts_attempts.fetch_add(1, Ordering::AcqRel);
            self.perhaps_lower_rts();
        }
    }

    /// Reads the line status register once and folds any receive errors
    /// into the error word and the wait history.
    pub fn process_lsr(&mut self) -> LineStatusRegister {
        let lsr = self.regs.read_line_status();
        self.holding_empty = lsr.thr_empty();

        if lsr.has_error() {
            tracing::debug!(port = %self.dev.name, ?lsr, "line status error");
            let mut errors = ErrorWord::new().with_overrun(lsr.overrun_error());
            if lsr.break_signal_received() {
                errors.set_break_received(true);
            } else {
                errors.set_parity(lsr.parity_error());
                errors.set_framing(lsr.framing_error());
            }
            self.error_word = self.error_word.union(errors);
            // The sink may block, so the record is written by a DPC.
            self.unlogged_errors = self.unlogged_errors.union(errors);
            self.dev.deferred.insert_queue_dpc(Dpc::LogLineErrors);
            if self.hand_flow.error_abort {
                self.dev.deferred.insert_queue_dpc(Dpc::CommError);
            }
            let events = WaitMask::new()
                .with_err(lsr.overrun_error() || lsr.parity_error() || lsr.framing_error())
                .with_break_received(lsr.break_signal_received());
            self.note_events(events);
        }

        if lsr.thr_empty() && self.write_pending() {
            self.kick_interrupts();
        }
        lsr
    }

    /// Records `events` that the wait mask enables and, if a wait is parked,
    /// hands the accumulated history to it and queues the `CommWait` DPC.
    pub fn note_events(&mut self, events: WaitMask) {
        let enabled = events.intersect(self.isr_wait_mask);
        if enabled.is_empty() {
            return;
        }
        let history = self.history_mask.union(enabled);
        self.history_mask = history;
        if let Some(wait) = self.wait.take() {
            self.history_mask = WaitMask::new();
            tracing::trace!(id = wait.id(), events = ?history, "wait satisfied");
            wait.set_output(Output::Events(history));
            self.dev.deferred.insert_queue_dpc(Dpc::CommWait);
        }
    }

    /// Duration of one character on the wire at the current line settings.
    pub fn char_time(&mut self) -> Duration {
        char_time(self.baud_rate, self.regs.read_line_control())
    }
}

fn char_time(baud_rate: u32, lcr: LineControlRegister) -> Duration {
    let data_bits = 5 + u64::from(lcr.data_word_length());
    let parity_bits = u64::from(lcr.parity() & 1);
    let stop_bits = 1 + u64::from(lcr.stop_bits());
    let bits = 1 + data_bits + parity_bits + stop_bits;
    Duration::from_micros(bits * 1_000_000 / u64::from(baud_rate.max(1)))
}
