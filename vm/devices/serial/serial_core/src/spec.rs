// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Modem and line register layouts of a 16550-compatible UART.
//!
//! Only the registers that flow control touches are described here. Field
//! naming follows the SC16C550B datasheet.

use bitfield_struct::bitfield;

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct LineControlRegister {
    #[bits(2)]
    pub data_word_length: u8,
    #[bits(1)]
    pub stop_bits: u8,
    #[bits(3)]
    pub parity: u8,
    pub break_enabled: bool,
    pub dlab: bool,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ModemControlRegister {
    pub dtr: bool, // Data Terminal Ready
    pub rts: bool, // Request To Send
    pub out1: bool,
    pub out2: bool,
    pub loopback: bool,
    #[bits(3)]
    _reserved: u8,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct LineStatusRegister {
    pub rx_ready: bool,
    pub overrun_error: bool,
    pub parity_error: bool,
    pub framing_error: bool,
    pub break_signal_received: bool,
    pub thr_empty: bool,
    pub thr_and_tsr_empty: bool,
    pub fifo_data_error: bool,
}

impl LineStatusRegister {
    /// Returns true if both the holding register and the shift register are
    /// empty, i.e. the last bit has left the wire.
    pub fn transmitter_idle(&self) -> bool {
        self.thr_empty() && self.thr_and_tsr_empty()
    }

    /// Returns true if any receive error bit is latched.
    pub fn has_error(&self) -> bool {
        self.overrun_error()
            || self.parity_error()
            || self.framing_error()
            || self.break_signal_received()
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ModemStatusRegister {
    pub cts_change: bool,
    pub dsr_change: bool,
    pub ri_went_low: bool,
    pub dcd_change: bool,
    pub cts: bool, // Clear To Send
    pub dsr: bool, // Data Set Ready
    pub ri: bool,  // Ring Indicator
    pub dcd: bool, // Data Carrier Detect
}

impl ModemStatusRegister {
    /// Returns true if any of the delta bits is set.
    pub fn any_change(&self) -> bool {
        self.cts_change() || self.dsr_change() || self.ri_went_low() || self.dcd_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions() {
        assert_eq!(u8::from(ModemControlRegister::new().with_dtr(true)), 0x01);
        assert_eq!(u8::from(ModemControlRegister::new().with_rts(true)), 0x02);
        assert_eq!(u8::from(LineControlRegister::new().with_break_enabled(true)), 0x40);
        assert_eq!(u8::from(ModemStatusRegister::new().with_cts(true)), 0x10);
        assert_eq!(u8::from(ModemStatusRegister::new().with_dcd(true)), 0x80);
        assert_eq!(
            u8::from(
                LineStatusRegister::new()
                    .with_thr_empty(true)
                    .with_thr_and_tsr_empty(true)
            ),
            0x60
        );
    }

    #[test]
    fn transmitter_idle_needs_both_bits() {
        let lsr = LineStatusRegister::new().with_thr_empty(true);
        assert!(!lsr.transmitter_idle());
        assert!(lsr.with_thr_and_tsr_empty(true).transmitter_idle());
    }
}
