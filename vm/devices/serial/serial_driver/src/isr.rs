// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Receive and transmit interrupt handling.

use crate::deferred::Dpc;
use crate::hw::Hw;
use crate::protocol::WaitMask;
use crate::request::RequestRefs;
use std::sync::atomic::Ordering;

impl Hw<'_> {
    /// Handles one received byte.
    pub fn receive_char(&mut self, ch: u8) {
        self.stats.received += 1;

        if self.hand_flow.dsr_sensitivity {
            self.handle_modem_update(false);
            if self.rx_holding.dsr() {
                tracing::trace!(port = %self.dev.name, ch, "dsr low, discarding byte");
                return;
            }
        }

        if self.hand_flow.auto_transmit {
            let chars = self.chars;
            if ch == chars.xoff {
                tracing::debug!(port = %self.dev.name, "xoff received");
                self.tx_holding.set_xoff(true);
                if self.transmit_toggle() {
                    self.schedule_lower_rts();
                }
                return;
            }
            if ch == chars.xon {
                tracing::debug!(port = %self.dev.name, "xon received");
                if self.tx_holding.xoff() {
                    self.tx_holding.set_xoff(false);
                    self.kick_if_transmit_pending();
                }
                return;
            }
        }

        let event_char = self.chars.event;
        self.note_events(
            WaitMask::new()
                .with_rx_char(true)
                .with_rx_flag(ch == event_char),
        );

        let filled = self
            .read
            .as_ref()
            .map(|read| read.request.push_data(&[ch]) >= read.wanted);
        match filled {
            Some(filled) => {
                self.read_by_isr += 1;
                if filled {
                    // The ISR reference stays until the completion DPC runs.
                    self.read = None;
                    self.dev.deferred.insert_queue_dpc(Dpc::CompleteRead);
                }
            }
            None => self.buffer_char(ch),
        }
    }

    fn buffer_char(&mut self, ch: u8) {
        self.check_receive_threshold();

        let buffer_size = self.buffer_size;
        if self.interrupt_buffer.len() < buffer_size {
            self.interrupt_buffer.push_back(ch);
            if self.interrupt_buffer.len() == buffer_size * 8 / 10 {
                self.note_events(WaitMask::new().with_rx80_full(true));
            }
        } else {
            tracing::debug!(port = %self.dev.name, buffer_size, "interrupt buffer overrun");
            self.error_word.set_queue_overrun(true);
            self.stats.buffer_overruns += 1;
            if self.hand_flow.error_abort {
                self.dev.deferred.insert_queue_dpc(Dpc::CommError);
            }
        }
    }

    /// Handles a transmit holding register empty interrupt: sends at most one
    /// byte, flow control bytes first.
    pub fn transmit_ready(&mut self) {
        self.holding_empty = true;
        if self.hand_flow.output_handshake() {
            self.handle_modem_update(true);
        }

        let tx_holding = self.tx_holding;
        let chars = self.chars;
        if self.send_xon_char && tx_holding.with_xoff(false).is_empty() {
            self.send_byte(chars.xon);
            self.send_xon_char = false;
            self.tx_holding.set_xoff(false);
            self.rx_holding.set_xoff(false);
        } else if self.send_xoff_char && tx_holding.is_empty() {
            self.send_byte(chars.xoff);
            self.send_xoff_char = false;
            if !self.hand_flow.xoff_continue {
                self.tx_holding.set_xoff(true);
            }
        } else if self.transmit_immediate() && (tx_holding.is_empty() || tx_holding.only_xoff()) {
            self.send_immediate();
        } else if self.write.is_some() && tx_holding.is_empty() {
            self.send_write_byte();
        } else if self.emptied_transmit
            && !self.write_pending()
            && self.dev.queued_writes.load(Ordering::Acquire) == 0
        {
            self.emptied_transmit = false;
            self.note_events(WaitMask::new().with_tx_empty(true));
        }
    }

    /// Writes one byte, raising RTS around it in transmit toggle mode.
    fn send_byte(&mut self, ch: u8) {
        let toggle = self.transmit_toggle();
        if toggle {
            self.set_rts();
        }
        self.regs.write_transmit(ch);
        self.stats.transmitted += 1;
        self.holding_empty = false;
        if toggle {
            self.schedule_lower_rts();
        }
    }

    fn send_immediate(&mut self) {
        let Some(request) = self.immediate.take() else {
            return;
        };
        if let Some(&ch) = request.write_data().first() {
            self.send_byte(ch);
        }
        tracing::trace!(port = %self.dev.name, id = request.id(), "immediate char sent");
        // The ISR reference stays until the completion DPC runs.
        request.set_information(1);
        self.dev.deferred.insert_queue_dpc(Dpc::CompleteImmediate);
    }

    fn send_write_byte(&mut self) {
        let next = self.write.as_ref().and_then(|write| {
            let data = write.request.write_data();
            data.get(write.sent).copied().map(|ch| (ch, data.len()))
        });
        let Some((ch, len)) = next else {
            return;
        };
        self.send_byte(ch);
        let done = match &mut self.write {
            Some(write) => {
                write.sent += 1;
                write.sent == len
            }
            None => false,
        };
        if done {
            if let Some(write) = self.write.take() {
                write.request.set_information(len);
                tracing::trace!(port = %self.dev.name, id = write.request.id(), "write drained");
            }
            self.emptied_transmit = true;
            self.dev.deferred.insert_queue_dpc(Dpc::CompleteWrite);
        }
    }

    /// Handles a line status interrupt.
    pub fn line_status(&mut self) {
        self.process_lsr();
    }

    /// Handles a modem status interrupt.
    pub fn modem_status(&mut self) {
        self.handle_modem_update(false);
    }

    /// Drops the receive path's claim on the current read, if it has one.
    pub fn grab_read_from_isr(&mut self) {
        if let Some(read) = self.read.take() {
            tracing::trace!(port = %self.dev.name, id = read.request.id(), "read taken from isr");
            read.request.clear_reference(RequestRefs::ISR);
        }
    }

    /// Drops the transmit path's claim on the current write, recording how
    /// much of it went out.
    pub fn grab_write_from_isr(&mut self) {
        if let Some(write) = self.write.take() {
            tracing::trace!(
                port = %self.dev.name,
                id = write.request.id(),
                sent = write.sent,
                "write taken from isr"
            );
            write.request.set_information(write.sent);
            write.request.clear_reference(RequestRefs::ISR);
            if self.transmit_toggle() {
                self.schedule_lower_rts();
            }
        }
    }

    /// Drops the transmit path's claim on an immediate character it has not
    /// sent yet.
    pub fn grab_immediate_from_isr(&mut self) {
        if let Some(request) = self.immediate.take() {
            tracing::trace!(port = %self.dev.name, id = request.id(), "immediate taken from isr");
            request.clear_reference(RequestRefs::ISR);
            if self.transmit_toggle() {
                self.schedule_lower_rts();
            }
        }
    }

    /// Drops the claim of a parked wait.
    pub fn grab_wait_from_isr(&mut self) {
        if let Some(wait) = self.wait.take() {
            wait.clear_reference(RequestRefs::ISR);
        }
    }

    /// Discards buffered input that no read has claimed.
    pub fn purge_interrupt_buffer(&mut self) {
        let discarded = self.interrupt_buffer.len();
        self.interrupt_buffer.clear();
        tracing::debug!(port = %self.dev.name, discarded, "receive buffer purged");
        self.handle_reduced_int_buffer();
    }
}
