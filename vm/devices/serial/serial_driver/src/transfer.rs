// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Starters for the read, write, mask and purge classes, and the deferred
//! routines that finish what they start.

use crate::deferred::Dpc;
use crate::deferred::Timer;
use crate::error_log::ErrorLogEntry;
use crate::error_log::LINE_ERROR_ERROR_VALUE;
use crate::hw::Hw;
use crate::hw::IsrRead;
use crate::hw::IsrWrite;
use crate::lifecycle::grab_immediate;
use crate::lifecycle::grab_read;
use crate::lifecycle::grab_write;
use crate::lifecycle::ReadProgress;
use crate::protocol::CommStatus;
use crate::protocol::WaitMask;
use crate::request::Location;
use crate::request::OpClass;
use crate::request::Output;
use crate::request::Request;
use crate::request::RequestKind;
use crate::request::RequestRefs;
use crate::request::Status;
use crate::DeviceInner;
use std::collections::VecDeque;
use std::time::Duration;

impl Hw<'_> {
    /// Moves buffered input into `request` until it holds `wanted` bytes.
    fn copy_from_interrupt_buffer(&mut self, request: &Request, wanted: usize) {
        let take = wanted
            .saturating_sub(request.data_len())
            .min(self.interrupt_buffer.len());
        if take == 0 {
            return;
        }
        let bytes: Vec<u8> = self.interrupt_buffer.drain(..take).collect();
        request.push_data(&bytes);
        self.handle_reduced_int_buffer();
    }

    /// Hands `request` to the receive path unless the buffer already
    /// satisfies it. Returns false if it was satisfied.
    fn give_read_to_isr(&mut self, request: &Request, wanted: usize) -> bool {
        self.copy_from_interrupt_buffer(request, wanted);
        if request.data_len() >= wanted {
            return false;
        }
        request.set_reference(RequestRefs::ISR);
        self.read = Some(IsrRead {
            request: request.clone(),
            wanted,
        });
        self.read_by_isr = 0;
        true
    }

    fn give_write_to_isr(&mut self, request: &Request) {
        self.write = Some(IsrWrite {
            request: request.clone(),
            sent: 0,
        });
        if self.transmit_toggle() {
            self.set_rts();
        }
        self.kick_if_transmit_pending();
    }

    fn give_immediate_to_isr(&mut self, request: &Request) {
        self.immediate = Some(request.clone());
        if self.transmit_toggle() {
            self.set_rts();
        }
        self.kick_if_transmit_pending();
    }

    /// Parks a wait, or satisfies it at once from events already seen.
    fn give_wait_to_isr(&mut self, request: &Request) {
        let history = self.history_mask;
        if history.is_empty() {
            self.wait = Some(request.clone());
            return;
        }
        self.history_mask = WaitMask::new();
        tracing::trace!(id = request.id(), events = ?history, "wait satisfied from history");
        request.set_output(Output::Events(history));
        self.dev.deferred.insert_queue_dpc(Dpc::CommWait);
    }

    /// Installs a new wait mask. A parked wait completes with no events.
    fn set_wait_mask(&mut self, mask: WaitMask) {
        if let Some(wait) = self.wait.take() {
            tracing::trace!(id = wait.id(), "wait finished by new mask");
            wait.set_output(Output::Events(WaitMask::new()));
            self.dev.deferred.insert_queue_dpc(Dpc::CommWait);
        }
        self.isr_wait_mask = mask;
        self.history_mask = WaitMask::new();
    }

    fn grow_interrupt_buffer(&mut self, mut buffer: VecDeque<u8>, size: usize) {
        if size <= self.buffer_size {
            return;
        }
        buffer.extend(self.interrupt_buffer.drain(..));
        self.interrupt_buffer = buffer;
        self.buffer_size = size;
        tracing::debug!(port = %self.dev.name, size, "interrupt buffer resized");
    }
}

/// How a wait-on-mask request left the mask class.
enum WaitStart {
    /// Parked in the wait slot.
    Parked { more: bool },
    Finished(Status),
}

impl DeviceInner {
    /// Records `status` on the current request of `class`, completes it and
    /// promotes the next one. Returns true if there is a next one.
    fn finish_current(&self, request: &Request, status: Status, class: OpClass) -> bool {
        request.set_status(status);
        if status == Status::Cancelled {
            request.set_information(0);
        }
        self.get_next_request(self.cancel.lock(), class, true)
    }

    /// Starts current requests of `class` until one stays pending or the
    /// class runs dry. Returns the status of the first one started.
    fn run_starter(&self, class: OpClass, mut start_one: impl FnMut(&Request) -> Status) -> Status {
        let mut first = None;
        loop {
            let current = self.cancel.lock().current(class);
            let Some(request) = current else {
                break;
            };
            let status = start_one(&request);
            first.get_or_insert(status);
            if status == Status::Pending || !self.finish_current(&request, status, class) {
                break;
            }
        }
        first.unwrap_or(Status::Pending)
    }

    pub(crate) fn start_read(&self) -> Status {
        self.run_starter(OpClass::Read, |request| match *request.kind() {
            RequestKind::SetQueueSize { size } => self.resize_interrupt_buffer(request, size),
            _ => self.start_one_read(request),
        })
    }

    fn resize_interrupt_buffer(&self, request: &Request, size: usize) -> Status {
        let Some(buffer) = request.take_side_buffer() else {
            tracing::error!(
                port = %self.name,
                id = request.id(),
                "queue size change has no buffer"
            );
            return Status::InsufficientResources;
        };
        self.synchronize(|hw| hw.grow_interrupt_buffer(VecDeque::from(buffer), size));
        Status::Success
    }

    fn start_one_read(&self, request: &Request) -> Status {
        let length = request.read_length();
        let policy = self.timeouts.lock().read_policy(length);

        self.synchronize(|hw| hw.copy_from_interrupt_buffer(request, length));
        let copied = request.data_len();
        if policy.return_immediately || copied >= length || (policy.return_on_any && copied > 0) {
            tracing::trace!(
                port = %self.name,
                id = request.id(),
                copied,
                "read satisfied from buffer"
            );
            return Status::Success;
        }

        let mut cancel = self.cancel.lock();
        if !self.make_cancelable(request, OpClass::Read) {
            return Status::Cancelled;
        }
        let wanted = if policy.crunch_to_one {
            copied + 1
        } else {
            length
        };
        if !self.synchronize(|hw| hw.give_read_to_isr(request, wanted)) {
            request.clear_reference(RequestRefs::CANCEL);
            request.set_location(Location::Current {
                class: OpClass::Read,
                cancelable: false,
            });
            return Status::Success;
        }

        cancel.read_progress = ReadProgress::Counting(request.data_len());
        cancel.last_read_time = self.deferred.now();
        if let Some(total) = policy.total {
            request.set_reference(RequestRefs::TOTAL_TIMER);
            self.arm(Timer::ReadTotal, total);
        }
        if let Some(interval) = policy.interval {
            request.set_reference(RequestRefs::INT_TIMER);
            cancel.read_interval = interval;
            self.arm(Timer::ReadInterval, interval);
        }
        tracing::trace!(port = %self.name, id = request.id(), wanted, "read handed to isr");
        Status::Pending
    }

    /// Arms a timer that no request should still own.
    fn arm(&self, timer: Timer, due: Duration) {
        if self.deferred.set_timer(timer, due) {
            tracing::error!(port = %self.name, ?timer, "timer was still armed");
        }
    }

    /// The receive path filled the current read.
    pub(crate) fn complete_read(&self) {
        let mut cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Read), RequestRefs::ISR) {
            tracing::trace!(port = %self.name, "stale read completion");
            return;
        }
        cancel.read_progress = ReadProgress::Finished(Status::Success);
        self.try_to_complete_current(
            cancel,
            OpClass::Read,
            RequestRefs::ISR,
            Status::Success,
            None,
        );
    }

    pub(crate) fn read_total_timeout(&self) {
        let mut cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Read), RequestRefs::TOTAL_TIMER) {
            return;
        }
        tracing::debug!(port = %self.name, "read total timeout");
        cancel.read_progress = ReadProgress::Finished(Status::Timeout);
        self.try_to_complete_current(
            cancel,
            OpClass::Read,
            RequestRefs::TOTAL_TIMER,
            Status::Timeout,
            Some(grab_read),
        );
    }

    /// Ends the read if no byte arrived for a whole interval after the first
    /// one. The interval does not run until something has been read.
    pub(crate) fn read_interval_timeout(&self) {
        let mut cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Read), RequestRefs::INT_TIMER) {
            return;
        }
        let progress = cancel.read_progress;
        let count = match progress {
            ReadProgress::Finished(status) => {
                self.try_to_complete_current(
                    cancel,
                    OpClass::Read,
                    RequestRefs::INT_TIMER,
                    status,
                    Some(grab_read),
                );
                return;
            }
            ReadProgress::Counting(count) => count,
        };

        let read_by_isr = self.synchronize(|hw| std::mem::take(&mut hw.read_by_isr));
        let now = self.deferred.now();
        let interval = cancel.read_interval;
        if read_by_isr > 0 {
            cancel.read_progress = ReadProgress::Counting(read_by_isr);
            cancel.last_read_time = now;
        } else if count > 0 && now.duration_since(cancel.last_read_time) >= interval {
            tracing::debug!(port = %self.name, "read interval timeout");
            self.try_to_complete_current(
                cancel,
                OpClass::Read,
                RequestRefs::INT_TIMER,
                Status::Timeout,
                Some(grab_read),
            );
            return;
        }
        self.deferred.set_timer(Timer::ReadInterval, interval);
    }

    pub(crate) fn start_write(&self) -> Status {
        self.run_starter(OpClass::Write, |request| self.start_one_write(request))
    }

    fn start_one_write(&self, request: &Request) -> Status {
        let total = self.timeouts.lock().write_total(request.write_data().len());

        let _cancel = self.cancel.lock();
        if !self.make_cancelable(request, OpClass::Write) {
            return Status::Cancelled;
        }
        request.set_reference(RequestRefs::ISR);
        self.synchronize(|hw| hw.give_write_to_isr(request));
        if let Some(total) = total {
            request.set_reference(RequestRefs::TOTAL_TIMER);
            self.arm(Timer::WriteTotal, total);
        }
        tracing::trace!(port = %self.name, id = request.id(), "write handed to isr");
        Status::Pending
    }

    /// The transmit path drained the current write.
    pub(crate) fn complete_write(&self) {
        let cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Write), RequestRefs::ISR) {
            tracing::trace!(port = %self.name, "stale write completion");
            return;
        }
        self.try_to_complete_current(
            cancel,
            OpClass::Write,
            RequestRefs::ISR,
            Status::Success,
            None,
        );
    }

    pub(crate) fn write_total_timeout(&self) {
        let cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Write), RequestRefs::TOTAL_TIMER) {
            return;
        }
        tracing::debug!(port = %self.name, "write total timeout");
        self.try_to_complete_current(
            cancel,
            OpClass::Write,
            RequestRefs::TOTAL_TIMER,
            Status::Timeout,
            Some(grab_write),
        );
    }

    /// Hands the immediate character to the transmit path. Its total
    /// timeout is that of a one byte write.
    pub(crate) fn start_immediate(&self) -> Status {
        self.run_starter(OpClass::Immediate, |request| {
            let total = self.timeouts.lock().write_total(1);

            let _cancel = self.cancel.lock();
            if !self.make_cancelable(request, OpClass::Immediate) {
                return Status::Cancelled;
            }
            request.set_reference(RequestRefs::ISR);
            self.synchronize(|hw| hw.give_immediate_to_isr(request));
            if let Some(total) = total {
                request.set_reference(RequestRefs::TOTAL_TIMER);
                self.arm(Timer::ImmediateTotal, total);
            }
            tracing::trace!(port = %self.name, id = request.id(), "immediate handed to isr");
            Status::Pending
        })
    }

    pub(crate) fn complete_immediate(&self) {
        let cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Immediate), RequestRefs::ISR) {
            tracing::trace!(port = %self.name, "stale immediate completion");
            return;
        }
        self.try_to_complete_current(
            cancel,
            OpClass::Immediate,
            RequestRefs::ISR,
            Status::Success,
            None,
        );
    }

    pub(crate) fn immediate_total_timeout(&self) {
        let cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Immediate), RequestRefs::TOTAL_TIMER) {
            return;
        }
        tracing::debug!(port = %self.name, "immediate char timeout");
        self.try_to_complete_current(
            cancel,
            OpClass::Immediate,
            RequestRefs::TOTAL_TIMER,
            Status::Timeout,
            Some(grab_immediate),
        );
    }

    pub(crate) fn start_mask(&self) -> Status {
        let mut first = None;
        loop {
            let current = self.cancel.lock().current(OpClass::Mask);
            let Some(request) = current else {
                break;
            };
            let more = match *request.kind() {
                RequestKind::WaitOnMask => match self.start_wait(&request) {
                    WaitStart::Parked { more } => {
                        first.get_or_insert(Status::Pending);
                        more
                    }
                    WaitStart::Finished(status) => {
                        first.get_or_insert(status);
                        self.finish_current(&request, status, OpClass::Mask)
                    }
                },
                RequestKind::SetWaitMask(mask) => {
                    tracing::debug!(port = %self.name, ?mask, "setting wait mask");
                    self.synchronize(|hw| hw.set_wait_mask(mask));
                    first.get_or_insert(Status::Success);
                    self.finish_current(&request, Status::Success, OpClass::Mask)
                }
                ref kind => {
                    tracing::error!(port = %self.name, ?kind, "unexpected request in mask queue");
                    first.get_or_insert(Status::InvalidParameter);
                    self.finish_current(&request, Status::InvalidParameter, OpClass::Mask)
                }
            };
            if !more {
                break;
            }
        }
        first.unwrap_or(Status::Pending)
    }

    /// Moves a wait-on-mask request from the mask class to the wait slot.
    fn start_wait(&self, request: &Request) -> WaitStart {
        let mut cancel = self.cancel.lock();
        if cancel.current(OpClass::Wait).is_some() {
            tracing::debug!(port = %self.name, id = request.id(), "a wait is already pending");
            return WaitStart::Finished(Status::InvalidParameter);
        }
        if self.synchronize(|hw| hw.isr_wait_mask.is_empty()) {
            tracing::debug!(port = %self.name, id = request.id(), "wait with an empty mask");
            return WaitStart::Finished(Status::InvalidParameter);
        }
        if !self.make_cancelable(request, OpClass::Wait) {
            return WaitStart::Finished(Status::Cancelled);
        }
        request.set_reference(RequestRefs::ISR);
        cancel.queue_mut(OpClass::Wait).current = Some(request.clone());
        self.synchronize(|hw| hw.give_wait_to_isr(request));
        let more = self.get_next_request(cancel, OpClass::Mask, false);
        WaitStart::Parked { more }
    }

    /// An event satisfied the parked wait, or a mask change finished it.
    pub(crate) fn complete_wait(&self) {
        let cancel = self.cancel.lock();
        if !owns(cancel.current(OpClass::Wait), RequestRefs::ISR) {
            tracing::trace!(port = %self.name, "stale wait completion");
            return;
        }
        self.try_to_complete_current(
            cancel,
            OpClass::Wait,
            RequestRefs::ISR,
            Status::Success,
            None,
        );
    }

    /// A line error with abort-on-error set: everything in flight goes.
    pub(crate) fn comm_error(&self) {
        tracing::debug!(port = %self.name, "aborting transfers after line error");
        self.kill_all_reads_or_writes(OpClass::Immediate);
        self.kill_all_reads_or_writes(OpClass::Write);
        self.kill_all_reads_or_writes(OpClass::Read);
    }

    /// Writes one diagnostic record covering every line error latched since
    /// the last one.
    pub(crate) fn log_line_errors(&self) {
        let errors = self.synchronize(|hw| std::mem::take(&mut hw.unlogged_errors));
        if errors.is_empty() {
            return;
        }
        tracing::warn!(port = %self.name, ?errors, "line errors");
        self.error_log.write_entry(ErrorLogEntry {
            device: self.name.clone(),
            unique_error_value: LINE_ERROR_ERROR_VALUE,
            major_function: None,
            retry_count: 0,
            final_status: Status::Success,
            specific_status: Status::HardwareFailure,
            insertions: vec![self.name.clone()],
            dump_data: vec![u32::from(errors)],
        });
    }

    pub(crate) fn start_purge(&self) -> Status {
        self.run_starter(OpClass::Purge, |request| {
            let RequestKind::Purge(flags) = *request.kind() else {
                return Status::InvalidParameter;
            };
            tracing::debug!(port = %self.name, ?flags, "purging");
            if flags.tx_abort() {
                self.kill_all_reads_or_writes(OpClass::Immediate);
                self.kill_all_reads_or_writes(OpClass::Write);
            }
            if flags.rx_abort() {
                self.kill_all_reads_or_writes(OpClass::Read);
            }
            if flags.rx_clear() {
                self.synchronize(|hw| hw.purge_interrupt_buffer());
            }
            Status::Success
        })
    }

    /// Snapshot of the line, clearing the latched errors.
    pub(crate) fn get_comm_status(&self) -> CommStatus {
        let cancel = self.cancel.lock();
        let queued = cancel.total_chars_queued;
        self.synchronize(|hw| {
            let sent = hw.write.as_ref().map_or(0, |write| write.sent);
            CommStatus {
                errors: std::mem::take(&mut hw.error_word),
                tx_holding: hw.tx_holding,
                rx_holding: hw.rx_holding,
                amount_in_in_queue: hw.chars_in_interrupt_buffer(),
                amount_in_out_queue: queued.saturating_sub(sent),
                wait_for_immediate: hw.transmit_immediate(),
            }
        })
    }
}

/// True if `current` exists and still carries `reference`.
fn owns(current: Option<Request>, reference: RequestRefs) -> bool {
    current.is_some_and(|request| request.has_reference(reference))
}

#[cfg(test)]
mod tests {
    use crate::config::SerialConfig;
    use crate::config::Timeouts;
    use crate::deferred::MockTimeSource;
    use crate::deferred::Timer;
    use crate::error_log::LINE_ERROR_ERROR_VALUE;
    use crate::protocol::ErrorWord;
    use crate::protocol::PurgeFlags;
    use crate::protocol::WaitMask;
    use crate::request::OpClass;
    use crate::request::Output;
    use crate::request::Request;
    use crate::request::RequestKind;
    use crate::request::Status;
    use crate::test_helpers::device_with;
    use crate::test_helpers::device_with_log;
    use crate::test_helpers::test_init;
    use serial_core::LineStatusRegister;
    use std::time::Duration;

    fn config_with(timeouts: Timeouts) -> SerialConfig {
        SerialConfig {
            timeouts,
            ..Default::default()
        }
    }

    #[test]
    fn read_satisfied_from_buffer() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        for &ch in b"hello" {
            device.isr_receive(ch);
        }
        let (read, mut completion) = Request::new(RequestKind::Read { length: 3 });
        assert_eq!(device.submit(read), Status::Success);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.information, 3);
        assert_eq!(result.output, Output::Data(b"hel".to_vec()));
        device.inner.synchronize(|hw| assert_eq!(hw.interrupt_buffer, *b"lo"));
    }

    #[test]
    fn read_filled_by_receive_path() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        device.isr_receive(b'a');
        let (read, mut completion) = Request::new(RequestKind::Read { length: 3 });
        assert_eq!(device.submit(read), Status::Pending);
        device.isr_receive(b'b');
        device.isr_receive(b'c');
        assert!(completion.try_completion().is_none());
        assert_eq!(device.run_deferred(), 1);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.output, Output::Data(b"abc".to_vec()));
        assert_eq!(device.pending_requests(), 0);
        assert_eq!(device.outstanding_deferred(), 0);
    }

    #[test]
    fn return_immediately_completes_empty() {
        test_init();
        let timeouts = Timeouts {
            read_interval: u32::MAX,
            ..Default::default()
        };
        let (device, _uart, _time) = device_with(config_with(timeouts), MockTimeSource::new());
        device.open();
        let (read, mut completion) = Request::new(RequestKind::Read { length: 8 });
        assert_eq!(device.submit(read), Status::Success);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.information, 0);
        assert_eq!(result.output, Output::Data(Vec::new()));
    }

    #[test]
    fn read_total_timeout_returns_partial_data() {
        test_init();
        let timeouts = Timeouts {
            read_total_constant: 100,
            ..Default::default()
        };
        let (device, _uart, time) = device_with(config_with(timeouts), MockTimeSource::new());
        device.open();
        let (read, mut completion) = Request::new(RequestKind::Read { length: 10 });
        assert_eq!(device.submit(read), Status::Pending);
        device.isr_receive(b'x');
        time.advance(Duration::from_millis(99));
        assert_eq!(device.run_deferred(), 0);
        time.advance(Duration::from_millis(1));
        assert_eq!(device.run_deferred(), 1);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Timeout);
        assert_eq!(result.output, Output::Data(b"x".to_vec()));
        assert_eq!(device.outstanding_deferred(), 0);
    }

    #[test]
    fn interval_timer_waits_for_first_byte() {
        test_init();
        let timeouts = Timeouts {
            read_interval: 10,
            ..Default::default()
        };
        let (device, _uart, time) = device_with(config_with(timeouts), MockTimeSource::new());
        device.open();
        let (read, mut completion) = Request::new(RequestKind::Read { length: 10 });
        assert_eq!(device.submit(read), Status::Pending);

        // Nothing received: the interval keeps re-arming.
        for _ in 0..3 {
            time.advance(Duration::from_millis(10));
            assert_eq!(device.run_deferred(), 1);
        }
        assert!(completion.try_completion().is_none());

        device.isr_receive(b'1');
        device.isr_receive(b'2');
        time.advance(Duration::from_millis(10));
        device.run_deferred();
        assert!(completion.try_completion().is_none());

        time.advance(Duration::from_millis(10));
        device.run_deferred();
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Timeout);
        assert_eq!(result.output, Output::Data(b"12".to_vec()));
        assert!(!device.inner.deferred.is_armed(Timer::ReadInterval));
        assert_eq!(device.outstanding_deferred(), 0);
    }

    #[test]
    fn cancel_pending_read_keeps_nothing() {
        test_init();
        let timeouts = Timeouts {
            read_total_constant: 1000,
            read_interval: 50,
            ..Default::default()
        };
        let (device, _uart, _time) = device_with(config_with(timeouts), MockTimeSource::new());
        device.open();
        let (read, mut completion) = Request::new(RequestKind::Read { length: 4 });
        device.submit(read.clone());
        device.isr_receive(b'q');
        device.cancel(&read);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Cancelled);
        assert_eq!(result.information, 0);
        assert_eq!(result.output, Output::Data(Vec::new()));
        assert_eq!(device.outstanding_deferred(), 0);
        assert_eq!(device.pending_requests(), 0);
    }

    #[test]
    fn write_drains_through_transmit_path() {
        test_init();
        let (device, uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (write, mut completion) = Request::new(RequestKind::Write(b"hi!".to_vec()));
        assert_eq!(device.submit(write), Status::Pending);
        for _ in 0..3 {
            device.isr_transmit_ready();
        }
        assert_eq!(uart.take_transmitted(), b"hi!");
        device.run_deferred();
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.information, 3);
        assert_eq!(device.inner.cancel.lock().total_chars_queued, 0);
    }

    #[test]
    fn write_total_timeout_reports_bytes_sent() {
        test_init();
        let timeouts = Timeouts {
            write_total_constant: 20,
            ..Default::default()
        };
        let (device, _uart, time) = device_with(config_with(timeouts), MockTimeSource::new());
        device.open();
        let (write, mut completion) = Request::new(RequestKind::Write(b"abcdef".to_vec()));
        device.submit(write);
        device.isr_transmit_ready();
        device.isr_transmit_ready();
        time.advance(Duration::from_millis(20));
        device.run_deferred();
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Timeout);
        assert_eq!(result.information, 2);
        assert_eq!(device.outstanding_deferred(), 0);
    }

    #[test]
    fn immediate_char_goes_ahead_of_the_current_write() {
        test_init();
        let (device, uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (first, mut c1) = Request::new(RequestKind::Write(b"ab".to_vec()));
        let (second, mut c2) = Request::new(RequestKind::Write(b"cd".to_vec()));
        device.submit(first);
        device.submit(second);
        device.isr_transmit_ready();

        let (immediate, mut c3) = Request::new(RequestKind::ImmediateChar(b'!'));
        assert_eq!(device.submit(immediate), Status::Pending);
        assert!(device.comm_status().wait_for_immediate);
        for _ in 0..8 {
            device.isr_transmit_ready();
            device.run_deferred();
        }
        assert_eq!(uart.take_transmitted(), b"a!bcd");
        assert_eq!(c1.try_completion().unwrap().information, 2);
        assert_eq!(c3.try_completion().unwrap().information, 1);
        assert_eq!(c2.try_completion().unwrap().information, 2);
        assert_eq!(device.inner.cancel.lock().total_chars_queued, 0);
        assert_eq!(device.pending_requests(), 0);
    }

    #[test]
    fn immediate_char_passes_an_xoff_held_write() {
        test_init();
        let (device, uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (write, mut write_completion) = Request::new(RequestKind::Write(b"abc".to_vec()));
        device.submit(write);
        device.isr_transmit_ready();
        device.inner.synchronize(|hw| hw.pretend_xoff());
        device.isr_transmit_ready();
        assert_eq!(uart.take_transmitted(), b"a");

        let (immediate, mut completion) = Request::new(RequestKind::ImmediateChar(b'!'));
        assert_eq!(device.submit(immediate), Status::Pending);
        device.isr_transmit_ready();
        device.run_deferred();
        assert_eq!(uart.take_transmitted(), b"!");
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.information, 1);
        assert!(write_completion.try_completion().is_none());

        device.inner.synchronize(|hw| hw.pretend_xon());
        for _ in 0..3 {
            device.isr_transmit_ready();
            device.run_deferred();
        }
        assert_eq!(uart.take_transmitted(), b"bc");
        assert_eq!(write_completion.try_completion().unwrap().information, 3);
        assert_eq!(device.outstanding_deferred(), 0);
    }

    #[test]
    fn immediate_char_waits_out_cts_and_refuses_a_second() {
        test_init();
        let mut config = SerialConfig::default();
        config.hand_flow.cts_handshake = true;
        let (device, uart, _time) = device_with(config, MockTimeSource::new());
        device.open();
        let (write, mut write_completion) = Request::new(RequestKind::Write(b"xy".to_vec()));
        device.submit(write);
        device.isr_transmit_ready();
        uart.set_cts(false);
        device.isr_modem_status();
        device.isr_transmit_ready();
        assert_eq!(uart.take_transmitted(), b"x");

        let (immediate, mut completion) = Request::new(RequestKind::ImmediateChar(b'!'));
        assert_eq!(device.submit(immediate), Status::Pending);
        assert!(device.inner.cancel.lock().current(OpClass::Immediate).is_some());
        let (again, mut refused) = Request::new(RequestKind::ImmediateChar(b'?'));
        assert_eq!(device.submit(again), Status::InvalidParameter);
        assert_eq!(refused.try_completion().unwrap().status, Status::InvalidParameter);

        // Only XOFF may hold back an immediate character.
        device.isr_transmit_ready();
        assert!(uart.take_transmitted().is_empty());

        uart.set_cts(true);
        device.isr_modem_status();
        device.isr_transmit_ready();
        device.run_deferred();
        assert_eq!(completion.try_completion().unwrap().status, Status::Success);
        device.isr_transmit_ready();
        device.run_deferred();
        assert_eq!(uart.take_transmitted(), b"!y");
        assert_eq!(write_completion.try_completion().unwrap().information, 2);
        assert_eq!(device.pending_requests(), 0);
        assert_eq!(device.outstanding_deferred(), 0);
    }

    #[test]
    fn cancelled_immediate_char_is_never_sent() {
        test_init();
        let (device, uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        device.inner.synchronize(|hw| hw.pretend_xoff());
        device.inner.synchronize(|hw| hw.tx_holding.set_cts(true));
        let (immediate, mut completion) = Request::new(RequestKind::ImmediateChar(b'!'));
        assert_eq!(device.submit(immediate.clone()), Status::Pending);
        device.cancel(&immediate);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Cancelled);
        assert_eq!(result.information, 0);
        device.isr_transmit_ready();
        assert!(uart.take_transmitted().is_empty());
        assert!(device.inner.cancel.lock().current(OpClass::Immediate).is_none());
        assert_eq!(device.inner.cancel.lock().total_chars_queued, 0);
    }

    #[test]
    fn comm_status_reports_queues_and_clears_errors() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        device.isr_receive(b'1');
        device.isr_receive(b'2');
        let (write, _c) = Request::new(RequestKind::Write(b"xyz".to_vec()));
        device.submit(write);
        device.isr_transmit_ready();
        device.inner.synchronize(|hw| hw.error_word.set_framing(true));

        let status = device.inner.get_comm_status();
        assert!(status.errors.framing());
        assert_eq!(status.amount_in_in_queue, 2);
        assert_eq!(status.amount_in_out_queue, 2);
        assert!(!status.wait_for_immediate);
        assert!(device.inner.get_comm_status().errors.is_empty());
    }

    #[test]
    fn line_errors_are_logged_outside_the_interrupt_path() {
        test_init();
        let (device, uart, _time, log) =
            device_with_log(SerialConfig::default(), MockTimeSource::new());
        device.open();
        uart.inject_line_errors(LineStatusRegister::new().with_parity_error(true));
        device.isr_line_status();
        uart.inject_line_errors(LineStatusRegister::new().with_overrun_error(true));
        device.isr_line_status();
        assert!(log.entries().is_empty());

        assert_eq!(device.run_deferred(), 1);
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unique_error_value, LINE_ERROR_ERROR_VALUE);
        assert_eq!(entries[0].specific_status, Status::HardwareFailure);
        let logged = ErrorWord::from(entries[0].dump_data[0]);
        assert_eq!(logged, ErrorWord::new().with_parity(true).with_overrun(true));
        assert_eq!(device.outstanding_deferred(), 0);

        // The latched word is still there for a status query.
        assert_eq!(device.comm_status().errors, logged);
        assert_eq!(device.run_deferred(), 0);
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn wait_on_mask_completes_on_event() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (set, _c) = Request::new(RequestKind::SetWaitMask(WaitMask::new().with_rx_char(true)));
        assert_eq!(device.submit(set), Status::Success);
        let (wait, mut completion) = Request::new(RequestKind::WaitOnMask);
        assert_eq!(device.submit(wait), Status::Pending);
        assert!(device.inner.cancel.lock().current(OpClass::Mask).is_none());

        device.isr_receive(b'z');
        device.run_deferred();
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(
            result.output,
            Output::Events(WaitMask::new().with_rx_char(true))
        );
        assert!(device.inner.cancel.lock().current(OpClass::Wait).is_none());
    }

    #[test]
    fn second_wait_is_rejected_and_new_mask_finishes_first() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (set, _c) = Request::new(RequestKind::SetWaitMask(WaitMask::new().with_cts(true)));
        device.submit(set);
        let (first, mut c1) = Request::new(RequestKind::WaitOnMask);
        let (second, mut c2) = Request::new(RequestKind::WaitOnMask);
        assert_eq!(device.submit(first), Status::Pending);
        assert_eq!(device.submit(second), Status::InvalidParameter);
        assert_eq!(c2.try_completion().unwrap().status, Status::InvalidParameter);

        let (reset, _c) = Request::new(RequestKind::SetWaitMask(WaitMask::new().with_dsr(true)));
        assert_eq!(device.submit(reset), Status::Success);
        device.run_deferred();
        let result = c1.try_completion().unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.output, Output::Events(WaitMask::new()));
    }

    #[test]
    fn wait_with_empty_mask_is_invalid() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (wait, mut completion) = Request::new(RequestKind::WaitOnMask);
        assert_eq!(device.submit(wait), Status::InvalidParameter);
        assert_eq!(completion.try_completion().unwrap().status, Status::InvalidParameter);
    }

    #[test]
    fn purge_aborts_and_clears() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        device.isr_receive(b'a');
        let (write, mut cw) = Request::new(RequestKind::Write(b"data".to_vec()));
        device.submit(write);
        let (read, mut cr) = Request::new(RequestKind::Read { length: 4 });
        device.submit(read);

        let flags = PurgeFlags::new()
            .with_tx_abort(true)
            .with_rx_abort(true)
            .with_rx_clear(true);
        let (purge, _c) = Request::new(RequestKind::Purge(flags));
        assert_eq!(device.submit(purge), Status::Success);
        assert_eq!(cw.try_completion().unwrap().status, Status::Cancelled);
        assert_eq!(cr.try_completion().unwrap().status, Status::Cancelled);
        device.inner.synchronize(|hw| assert!(hw.interrupt_buffer.is_empty()));
        assert_eq!(device.pending_requests(), 0);
    }

    #[test]
    fn queue_size_grows_and_keeps_data() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        device.isr_receive(b'k');
        let (resize, _c) = Request::new(RequestKind::SetQueueSize { size: 8192 });
        assert_eq!(device.submit(resize), Status::Success);
        device.inner.synchronize(|hw| {
            assert_eq!(hw.buffer_size, 8192);
            assert_eq!(hw.interrupt_buffer, [b'k']);
        });
    }
}
