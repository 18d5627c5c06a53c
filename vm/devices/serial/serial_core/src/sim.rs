// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory UART model implementing [`UartRegisters`].
//!
//! The model is split into two halves sharing one state: the
//! [`SimulatedUart`], which is handed to a driver as its register block, and
//! the [`SimulatedUartControl`], which plays the role of the wire and the
//! remote modem. The control half can drive the modem status lines, hold the
//! transmitter busy, inject line errors, and observe what the driver did to
//! DTR, RTS, and break.

use crate::LineControlRegister;
use crate::LineStatusRegister;
use crate::ModemControlRegister;
use crate::ModemStatusRegister;
use crate::UartRegisters;
use parking_lot::Mutex;
use std::sync::Arc;

/// Returns a new simulated UART with all modem status lines asserted and an
/// idle transmitter, plus the handle used to control it.
pub fn simulated_uart() -> (SimulatedUart, SimulatedUartControl) {
    let state = Arc::new(Mutex::new(State::new()));
    (
        SimulatedUart {
            state: state.clone(),
        },
        SimulatedUartControl { state },
    )
}

#[derive(Debug)]
struct State {
    mcr: ModemControlRegister,
    lcr: LineControlRegister,
    msr: ModemStatusRegister,
    transmitter_busy: bool,
    latched_errors: LineStatusRegister,
    transmitted: Vec<u8>,
    interrupt_kicks: u64,
    dtr_transitions: u64,
    rts_transitions: u64,
}

impl State {
    fn new() -> Self {
        Self {
            mcr: ModemControlRegister::new(),
            lcr: LineControlRegister::new().with_data_word_length(3),
            msr: ModemStatusRegister::new()
                .with_cts(true)
                .with_dsr(true)
                .with_dcd(true),
            transmitter_busy: false,
            latched_errors: LineStatusRegister::new(),
            transmitted: Vec::new(),
            interrupt_kicks: 0,
            dtr_transitions: 0,
            rts_transitions: 0,
        }
    }

    /// Call `f`, which updates the MSR lines, then update MSR change bits.
    fn update_msr(&mut self, f: impl FnOnce(&mut ModemStatusRegister)) {
        let old = self.msr;
        f(&mut self.msr);
        let new = self.msr;
        if old.cts() != new.cts() {
            self.msr.set_cts_change(true);
        }
        if old.dsr() != new.dsr() {
            self.msr.set_dsr_change(true);
        }
        if old.ri() && !new.ri() {
            self.msr.set_ri_went_low(true);
        }
        if old.dcd() != new.dcd() {
            self.msr.set_dcd_change(true);
        }
    }
}

/// The register half of a simulated UART.
#[derive(Debug)]
pub struct SimulatedUart {
    state: Arc<Mutex<State>>,
}

impl UartRegisters for SimulatedUart {
    fn read_modem_control(&mut self) -> ModemControlRegister {
        self.state.lock().mcr
    }

    fn write_modem_control(&mut self, value: ModemControlRegister) {
        let mut state = self.state.lock();
        if state.mcr.dtr() != value.dtr() {
            state.dtr_transitions += 1;
        }
        if state.mcr.rts() != value.rts() {
            state.rts_transitions += 1;
        }
        tracing::trace!(mcr = ?value, "simulated mcr write");
        state.mcr = value;
    }

    fn read_line_control(&mut self) -> LineControlRegister {
        self.state.lock().lcr
    }

    fn write_line_control(&mut self, value: LineControlRegister) {
        self.state.lock().lcr = value;
    }

    fn read_line_status(&mut self) -> LineStatusRegister {
        let mut state = self.state.lock();
        let lsr = state
            .latched_errors
            .with_thr_empty(!state.transmitter_busy)
            .with_thr_and_tsr_empty(!state.transmitter_busy);
        state.latched_errors = LineStatusRegister::new();
        lsr
    }

    fn read_modem_status(&mut self) -> ModemStatusRegister {
        let mut state = self.state.lock();
        let msr = state.msr;
        state.msr.set_cts_change(false);
        state.msr.set_dsr_change(false);
        state.msr.set_ri_went_low(false);
        state.msr.set_dcd_change(false);
        msr
    }

    fn write_transmit(&mut self, data: u8) {
        self.state.lock().transmitted.push(data);
    }

    fn kick_interrupts(&mut self) {
        self.state.lock().interrupt_kicks += 1;
    }
}

/// The wire/modem half of a simulated UART.
#[derive(Debug, Clone)]
pub struct SimulatedUartControl {
    state: Arc<Mutex<State>>,
}

impl SimulatedUartControl {
    /// Returns whether the driver currently asserts DTR.
    pub fn dtr(&self) -> bool {
        self.state.lock().mcr.dtr()
    }

    /// Returns whether the driver currently asserts RTS.
    pub fn rts(&self) -> bool {
        self.state.lock().mcr.rts()
    }

    /// Returns how many times DTR changed level.
    pub fn dtr_transitions(&self) -> u64 {
        self.state.lock().dtr_transitions
    }

    /// Returns how many times RTS changed level.
    pub fn rts_transitions(&self) -> u64 {
        self.state.lock().rts_transitions
    }

    /// Returns whether the driver is currently sending a break.
    pub fn break_enabled(&self) -> bool {
        self.state.lock().lcr.break_enabled()
    }

    /// Returns how many times the driver provoked an interrupt.
    pub fn interrupt_kicks(&self) -> u64 {
        self.state.lock().interrupt_kicks
    }

    /// Takes every byte written to the transmit holding register so far.
    pub fn take_transmitted(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().transmitted)
    }

    /// Sets the Clear To Send input.
    pub fn set_cts(&self, value: bool) {
        self.state.lock().update_msr(|msr| msr.set_cts(value));
    }

    /// Sets the Data Set Ready input.
    pub fn set_dsr(&self, value: bool) {
        self.state.lock().update_msr(|msr| msr.set_dsr(value));
    }

    /// Sets the Data Carrier Detect input.
    pub fn set_dcd(&self, value: bool) {
        self.state.lock().update_msr(|msr| msr.set_dcd(value));
    }

    /// Sets the Ring Indicator input.
    pub fn set_ri(&self, value: bool) {
        self.state.lock().update_msr(|msr| msr.set_ri(value));
    }

    /// Holds the transmitter busy (holding or shift register not empty).
    pub fn set_transmitter_busy(&self, busy: bool) {
        self.state.lock().transmitter_busy = busy;
    }

    /// Latches receive error bits, reported by the next line status read.
    pub fn inject_line_errors(&self, errors: LineStatusRegister) {
        let mut state = self.state.lock();
        state.latched_errors =
            LineStatusRegister::from(u8::from(state.latched_errors) | u8::from(errors));
    }
}
