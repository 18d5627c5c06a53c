// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Flow control policy: when to drop or raise DTR and RTS, when to hold
//! transmission, and when XON/XOFF must go out.
//!
//! All of this runs under the hardware lock.

use crate::config::DtrControl;
use crate::config::HandFlow;
use crate::config::RtsControl;
use crate::deferred::Dpc;
use crate::deferred::Timer;
use crate::hw::Hw;
use crate::protocol::WaitMask;
use crate::DeviceInner;
use serial_core::ModemStatusRegister;
use std::sync::atomic::Ordering;

impl Hw<'_> {
    /// Switches to a new flow control policy. Each aspect (DTR, RTS,
    /// auto-receive, auto-transmit) is only acted on if it changed or the
    /// device is being opened.
    pub fn setup_new_hand_flow(&mut self, new: &HandFlow) {
        let opening = !self.device_is_opened;
        let chars = self.chars_in_interrupt_buffer();
        let over_threshold = chars >= new.hold_threshold(self.buffer_size);

        if opening || self.hand_flow.dtr != new.dtr {
            tracing::debug!(port = %self.dev.name, dtr = ?new.dtr, "processing dtr flow");
            match new.dtr {
                DtrControl::Handshake => {
                    if over_threshold {
                        tracing::debug!(port = %self.dev.name, chars, "dtr holding reception");
                        self.rx_holding.set_dtr(true);
                        self.clr_dtr();
                    } else if self.rx_holding.dtr() {
                        if chars <= new.xon_limit {
                            tracing::debug!(
                                port = %self.dev.name,
                                chars,
                                "dtr releasing reception"
                            );
                            self.rx_holding.set_dtr(false);
                            self.set_dtr();
                        }
                    } else {
                        self.set_dtr();
                    }
                }
                DtrControl::Control => {
                    self.rx_holding.set_dtr(false);
                    self.set_dtr();
                }
                DtrControl::Disabled => {
                    self.rx_holding.set_dtr(false);
                    self.clr_dtr();
                }
            }
        }

        if opening || self.hand_flow.rts != new.rts {
            tracing::debug!(port = %self.dev.name, rts = ?new.rts, "processing rts flow");
            match new.rts {
                RtsControl::Handshake => {
                    if over_threshold {
                        tracing::debug!(port = %self.dev.name, chars, "rts holding reception");
                        self.rx_holding.set_rts(true);
                        self.clr_rts();
                    } else if self.rx_holding.rts() {
                        if chars <= new.xon_limit {
                            tracing::debug!(
                                port = %self.dev.name,
                                chars,
                                "rts releasing reception"
                            );
                            self.rx_holding.set_rts(false);
                            self.set_rts();
                        }
                    } else {
                        self.set_rts();
                    }
                }
                RtsControl::Control => {
                    self.rx_holding.set_rts(false);
                    self.set_rts();
                }
                RtsControl::TransmitToggle => {
                    self.rx_holding.set_rts(false);
                    // The lowering check below must already see toggle mode.
                    self.hand_flow.rts = RtsControl::TransmitToggle;
                    let shift_register_busy = !self.process_lsr().transmitter_idle();
                    if self.tx_holding.break_on()
                        || shift_register_busy
                        || self.output_pending_and_not_held()
                    {
                        self.set_rts();
                    } else {
                        self.dev.lower_rts_attempts.fetch_add(1, Ordering::AcqRel);
                        self.perhaps_lower_rts();
                    }
                }
                RtsControl::Disabled => {
                    self.rx_holding.set_rts(false);
                    self.clr_rts();
                }
            }
        }

        if opening || self.hand_flow.auto_receive != new.auto_receive {
            if new.auto_receive {
                if over_threshold {
                    self.rx_holding.set_xoff(true);
                    self.prod_xon_xoff(false);
                }
            } else if self.rx_holding.xoff() {
                self.rx_holding.set_xoff(false);
                self.prod_xon_xoff(true);
            }
        }

        if (opening || self.hand_flow.auto_transmit != new.auto_transmit)
            && !new.auto_transmit
            && self.tx_holding.xoff()
        {
            self.tx_holding.set_xoff(false);
            self.prod_xon_xoff(true);
        }

        self.hand_flow = *new;
    }

    /// Applies a new policy and re-evaluates the modem lines under it.
    pub fn set_hand_flow(&mut self, new: &HandFlow) {
        self.setup_new_hand_flow(new);
        self.handle_modem_update(false);
    }

    /// Called after received bytes leave the interrupt buffer. Releases
    /// receive holds once occupancy is at or below the Xon limit.
    pub fn handle_reduced_int_buffer(&mut self) {
        if self.rx_holding.is_empty() {
            return;
        }
        let chars = self.chars_in_interrupt_buffer();
        if chars > self.hand_flow.xon_limit {
            return;
        }
        if self.rx_holding.dtr() {
            tracing::debug!(port = %self.dev.name, chars, "dtr releasing reception");
            self.rx_holding.set_dtr(false);
            self.set_dtr();
        }
        if self.rx_holding.rts() {
            tracing::debug!(port = %self.dev.name, chars, "rts releasing reception");
            self.rx_holding.set_rts(false);
            self.set_rts();
        }
        if self.rx_holding.xoff() {
            self.prod_xon_xoff(true);
        }
    }

    /// Arranges for XON (or XOFF) to be the next byte sent and provokes a
    /// transmit interrupt if the transmitter is idle.
    pub fn prod_xon_xoff(&mut self, send_xon: bool) {
        if !self.send_xon_char && !self.send_xoff_char && self.holding_empty {
            self.kick_interrupts();
        }
        self.send_xon_char = send_xon;
        self.send_xoff_char = !send_xon;
        tracing::debug!(port = %self.dev.name, send_xon, "prodding xon/xoff");
    }

    /// Reads the modem status register and applies it: DSR sensitivity,
    /// modem wait events, and CTS/DSR/DCD transmit holds. `doing_tx` is set
    /// when called from the transmit path, which will send next anyway.
    pub fn handle_modem_update(&mut self, doing_tx: bool) -> ModemStatusRegister {
        let old_tx_holding = self.tx_holding;
        let msr = self.regs.read_modem_status();

        let dsr_hold = self.hand_flow.dsr_sensitivity && !msr.dsr();
        self.rx_holding.set_dsr(dsr_hold);

        self.note_events(
            WaitMask::new()
                .with_cts(msr.cts_change())
                .with_dsr(msr.dsr_change())
                .with_ring(msr.ri_went_low())
                .with_rlsd(msr.dcd_change()),
        );

        let hand_flow = self.hand_flow;
        if hand_flow.output_handshake() {
            self.tx_holding
                .set_cts(hand_flow.cts_handshake && !msr.cts());
            self.tx_holding
                .set_dsr(hand_flow.dsr_handshake && !msr.dsr());
            self.tx_holding
                .set_dcd(hand_flow.dcd_handshake && !msr.dcd());

            if old_tx_holding.is_empty() && !self.tx_holding.is_empty() && self.transmit_toggle()
            {
                self.schedule_lower_rts();
            }
        } else {
            self.tx_holding.set_cts(false);
            self.tx_holding.set_dsr(false);
            self.tx_holding.set_dcd(false);
        }

        if self.tx_holding != old_tx_holding {
            tracing::debug!(
                port = %self.dev.name,
                old = ?old_tx_holding,
                new = ?self.tx_holding,
                "transmit holding changed"
            );
        }
        if !doing_tx && !old_tx_holding.is_empty() && self.tx_holding.is_empty() {
            self.kick_if_transmit_pending();
        }
        msr
    }

    /// Output that would keep RTS raised in transmit toggle mode: data the
    /// transmit path still owns, or writes waiting in the queue, provided
    /// nothing holds transmission.
    pub fn output_pending_and_not_held(&self) -> bool {
        (self.write_pending() || self.dev.queued_writes.load(Ordering::Acquire) > 0)
            && self.tx_holding.is_empty()
    }

    /// One attempt at lowering RTS in transmit toggle mode. Consumes the
    /// attempt counted by whoever scheduled it.
    pub fn perhaps_lower_rts(&mut self) {
        if self.transmit_toggle()
            && !self.tx_holding.break_on()
            && !self.output_pending_and_not_held()
        {
            if self.process_lsr().transmitter_idle() {
                self.clr_rts();
            } else {
                self.schedule_lower_rts();
            }
        }
        self.dev.decrement_rts_counter();
    }

    /// Counts a new RTS lowering attempt and queues the DPC that arms the
    /// character timer for it.
    pub fn schedule_lower_rts(&mut self) {
        self.dev.schedule_lower_rts();
    }

    /// Acts as if XOFF was received, whether or not auto-transmit is on.
    pub fn pretend_xoff(&mut self) {
        self.tx_holding.set_xoff(true);
        if self.transmit_toggle() {
            self.schedule_lower_rts();
        }
    }

    /// Acts as if XON was received.
    pub fn pretend_xon(&mut self) {
        if !self.tx_holding.is_empty() {
            self.tx_holding.set_xoff(false);
            self.kick_if_transmit_pending();
        }
    }

    /// Engages receive flow control if one more byte would reach the hold
    /// threshold.
    pub fn check_receive_threshold(&mut self) {
        let hand_flow = self.hand_flow;
        let threshold = hand_flow.hold_threshold(self.buffer_size);
        if threshold > self.chars_in_interrupt_buffer() + 1 {
            return;
        }
        if hand_flow.dtr == DtrControl::Handshake && !self.rx_holding.dtr() {
            tracing::debug!(port = %self.dev.name, "dtr holding reception");
            self.rx_holding.set_dtr(true);
            self.clr_dtr();
        }
        if hand_flow.rts == RtsControl::Handshake && !self.rx_holding.rts() {
            tracing::debug!(port = %self.dev.name, "rts holding reception");
            self.rx_holding.set_rts(true);
            self.clr_rts();
        }
        if hand_flow.auto_receive && !self.rx_holding.xoff() {
            self.rx_holding.set_xoff(true);
            self.prod_xon_xoff(false);
        }
    }
}

impl DeviceInner {
    pub(crate) fn schedule_lower_rts(&self) {
        self.lower_rts_attempts.fetch_add(1, Ordering::AcqRel);
        if !self.deferred.insert_queue_dpc(Dpc::StartTimerLowerRts) {
            self.decrement_rts_counter();
        }
    }

    pub(crate) fn decrement_rts_counter(&self) {
        let count = self.lower_rts_attempts.fetch_sub(1, Ordering::AcqRel) - 1;
        if count < 0 {
            tracing::error!(port = %self.name, count, "rts lowering counter underflow");
        }
        debug_assert!(count >= 0, "rts lowering counter underflow");
    }

    /// `StartTimerLowerRts` DPC: arm the character timer, or fold this
    /// attempt into the one whose timer is already armed.
    pub(crate) fn start_timer_lower_rts(&self) {
        let char_time = self.synchronize(|hw| hw.char_time());
        if self.deferred.set_timer(Timer::LowerRts, char_time) {
            self.decrement_rts_counter();
        }
    }

    /// `LowerRts` timer expiry.
    pub(crate) fn invoke_perhaps_lower_rts(&self) {
        self.synchronize(|hw| hw.perhaps_lower_rts());
    }
}
