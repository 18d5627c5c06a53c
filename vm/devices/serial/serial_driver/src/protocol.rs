// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bit-level definitions exchanged with callers: wait events, purge flags,
//! the error word and the holding reasons.

use bitfield_struct::bitfield;

/// Events a wait-on-mask request can be satisfied by.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct WaitMask {
    pub rx_char: bool,
    pub rx_flag: bool,
    pub tx_empty: bool,
    pub cts: bool,
    pub dsr: bool,
    pub rlsd: bool,
    pub break_received: bool,
    pub err: bool,
    pub ring: bool,
    _reserved0: bool,
    pub rx80_full: bool,
    #[bits(21)]
    _reserved1: u32,
}

impl WaitMask {
    /// True if no event bit is set.
    pub fn is_empty(&self) -> bool {
        u32::from(*self) == 0
    }

    pub(crate) fn union(self, other: Self) -> Self {
        Self::from(u32::from(self) | u32::from(other))
    }

    pub(crate) fn intersect(self, other: Self) -> Self {
        Self::from(u32::from(self) & u32::from(other))
    }
}

/// Purge request flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PurgeFlags {
    pub tx_abort: bool,
    pub rx_abort: bool,
    pub tx_clear: bool,
    pub rx_clear: bool,
    #[bits(28)]
    _reserved: u32,
}

/// Latched receive errors, reported and cleared by a status query.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ErrorWord {
    pub break_received: bool,
    pub framing: bool,
    pub overrun: bool,
    pub queue_overrun: bool,
    pub parity: bool,
    #[bits(27)]
    _reserved: u32,
}

impl ErrorWord {
    /// True if no error is latched.
    pub fn is_empty(&self) -> bool {
        u32::from(*self) == 0
    }

    pub(crate) fn union(self, other: Self) -> Self {
        Self::from(u32::from(self) | u32::from(other))
    }
}

/// Reasons reception is currently held off.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct RxHolding {
    pub dtr: bool,
    pub xoff: bool,
    pub rts: bool,
    pub dsr: bool,
    #[bits(4)]
    _reserved: u8,
}

impl RxHolding {
    /// True if nothing holds reception.
    pub fn is_empty(&self) -> bool {
        u8::from(*self) == 0
    }
}

/// Reasons transmission is currently held off.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TxHolding {
    pub cts: bool,
    pub dsr: bool,
    pub dcd: bool,
    pub xoff: bool,
    pub break_on: bool,
    #[bits(3)]
    _reserved: u8,
}

impl TxHolding {
    /// True if nothing holds transmission.
    pub fn is_empty(&self) -> bool {
        u8::from(*self) == 0
    }

    /// True if XOFF is the only reason transmission is held.
    pub fn only_xoff(&self) -> bool {
        *self == Self::new().with_xoff(true)
    }
}

/// Result of a status query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommStatus {
    /// Errors latched since the previous query. Cleared by the query.
    pub errors: ErrorWord,
    /// Why transmission is held.
    pub tx_holding: TxHolding,
    /// Why reception is held.
    pub rx_holding: RxHolding,
    /// Bytes waiting in the receive interrupt buffer.
    pub amount_in_in_queue: usize,
    /// Bytes queued for transmission and not yet sent.
    pub amount_in_out_queue: usize,
    /// An immediate character is waiting to be sent.
    pub wait_for_immediate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_values() {
        assert_eq!(u32::from(WaitMask::new().with_rx80_full(true)), 0x400);
        assert_eq!(u32::from(WaitMask::new().with_ring(true)), 0x100);
        assert_eq!(u32::from(PurgeFlags::new().with_rx_clear(true)), 0x8);
        assert_eq!(u32::from(ErrorWord::new().with_queue_overrun(true)), 0x8);
        assert_eq!(u8::from(RxHolding::new().with_dsr(true)), 0x8);
        assert_eq!(u8::from(TxHolding::new().with_break_on(true)), 0x10);
    }

    #[test]
    fn only_xoff() {
        assert!(TxHolding::new().with_xoff(true).only_xoff());
        assert!(!TxHolding::new().with_xoff(true).with_cts(true).only_xoff());
        assert!(!TxHolding::new().only_xoff());
    }
}
