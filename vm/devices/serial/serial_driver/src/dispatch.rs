// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dispatch front end: admission, then routing by request kind.

use crate::admission::Admission;
use crate::config::ConfigError;
use crate::config::DtrControl;
use crate::config::HandFlow;
use crate::config::RtsControl;
use crate::config::SerialChars;
use crate::config::Timeouts;
use crate::request::OpClass;
use crate::request::Output;
use crate::request::Request;
use crate::request::RequestKind;
use crate::request::Status;
use crate::DeviceInner;
use crate::SerialDevice;

/// Where a request goes after admission.
enum Route {
    /// Onto a class queue, to be started in arrival order.
    Queue(OpClass),
    /// Handled inline; complete with this status.
    Done(Status),
}

impl SerialDevice {
    /// Submits a request. The returned status is the request's final status,
    /// or [`Status::Pending`] if it will complete later through its
    /// [`RequestCompletion`](crate::request::RequestCompletion).
    pub fn submit(&self, request: Request) -> Status {
        tracing::trace!(
            port = %self.inner.name,
            id = request.id(),
            kind = ?request.kind(),
            "submit"
        );
        self.inner.request_prologue(&request);
        self.inner.admit_and_route(request)
    }
}

impl DeviceInner {
    /// Runs the gate and routes what it lets through. The request has
    /// already been counted by the prologue.
    pub(crate) fn admit_and_route(&self, request: Request) -> Status {
        match self.filter(&request) {
            Admission::Accepted => {}
            Admission::Stalled => return Status::Pending,
            Admission::Rejected(status) => return self.complete_with(&request, status),
        }
        if self.complete_if_error(&request) {
            return Status::Cancelled;
        }
        match self.route(&request) {
            Route::Queue(class) => self.start_or_queue(request, class),
            Route::Done(status) => self.complete_with(&request, status),
        }
    }

    fn route(&self, request: &Request) -> Route {
        match request.kind() {
            RequestKind::Read { length: 0 } => Route::Done(Status::Success),
            RequestKind::Read { .. } => Route::Queue(OpClass::Read),
            RequestKind::SetQueueSize { size } => self.route_queue_size(request, *size),
            RequestKind::Write(data) if data.is_empty() => Route::Done(Status::Success),
            RequestKind::Write(_) => Route::Queue(OpClass::Write),
            RequestKind::ImmediateChar(_) => Route::Queue(OpClass::Immediate),
            RequestKind::SetWaitMask(_) | RequestKind::WaitOnMask => Route::Queue(OpClass::Mask),
            RequestKind::Purge(flags) => {
                if u32::from(*flags) == 0 {
                    Route::Done(Status::InvalidParameter)
                } else {
                    Route::Queue(OpClass::Purge)
                }
            }
            RequestKind::GetCommStatus => {
                request.set_output(Output::CommStatus(self.get_comm_status()));
                Route::Done(Status::Success)
            }
            RequestKind::SetHandFlow(hand_flow) => Route::Done(self.set_hand_flow(hand_flow)),
            RequestKind::SetTimeouts(timeouts) => Route::Done(self.set_timeouts(timeouts)),
            RequestKind::SetChars(chars) => Route::Done(self.set_chars(chars)),
            RequestKind::SetDtr | RequestKind::ClrDtr => {
                let set = matches!(request.kind(), RequestKind::SetDtr);
                Route::Done(self.set_dtr_line(set))
            }
            RequestKind::SetRts | RequestKind::ClrRts => {
                let set = matches!(request.kind(), RequestKind::SetRts);
                Route::Done(self.set_rts_line(set))
            }
            RequestKind::SetBreakOn => {
                self.synchronize(|hw| hw.turn_on_break());
                Route::Done(Status::Success)
            }
            RequestKind::SetBreakOff => {
                self.synchronize(|hw| hw.turn_off_break());
                Route::Done(Status::Success)
            }
            RequestKind::SetXoff => {
                self.synchronize(|hw| hw.pretend_xoff());
                Route::Done(Status::Success)
            }
            RequestKind::SetXon => {
                self.synchronize(|hw| hw.pretend_xon());
                Route::Done(Status::Success)
            }
            // Owned by the PnP and power layers; nothing to do here once
            // they are past the gate.
            RequestKind::Pnp | RequestKind::Power => Route::Done(Status::Success),
        }
    }

    /// Queue size changes only ever grow the buffer. The replacement buffer
    /// is allocated here so the starter cannot fail.
    fn route_queue_size(&self, request: &Request, size: usize) -> Route {
        let current = self.synchronize(|hw| hw.buffer_size);
        if size <= current {
            return Route::Done(Status::Success);
        }
        match request.allocate_side_buffer(size) {
            Ok(()) => Route::Queue(OpClass::Read),
            Err(err) => {
                tracing::warn!(
                    port = %self.name,
                    error = &err as &dyn std::error::Error,
                    "failed to allocate interrupt buffer"
                );
                Route::Done(err.into())
            }
        }
    }

    fn set_hand_flow(&self, hand_flow: &HandFlow) -> Status {
        let result = self.synchronize(|hw| -> Result<(), ConfigError> {
            hand_flow.validate(hw.buffer_size)?;
            hw.chars.validate(hand_flow)?;
            hw.set_hand_flow(hand_flow);
            Ok(())
        });
        match result {
            Ok(()) => {
                tracing::debug!(port = %self.name, ?hand_flow, "hand flow set");
                Status::Success
            }
            Err(err) => {
                tracing::debug!(
                    port = %self.name,
                    error = &err as &dyn std::error::Error,
                    "rejected hand flow"
                );
                Status::InvalidParameter
            }
        }
    }

    fn set_timeouts(&self, timeouts: &Timeouts) -> Status {
        if let Err(err) = timeouts.validate() {
            tracing::debug!(
                port = %self.name,
                error = &err as &dyn std::error::Error,
                "rejected timeouts"
            );
            return Status::InvalidParameter;
        }
        *self.timeouts.lock() = *timeouts;
        Status::Success
    }

    fn set_chars(&self, chars: &SerialChars) -> Status {
        let result = self.synchronize(|hw| -> Result<(), ConfigError> {
            chars.validate(&hw.hand_flow)?;
            hw.chars = *chars;
            Ok(())
        });
        if let Err(err) = result {
            tracing::debug!(
                port = %self.name,
                error = &err as &dyn std::error::Error,
                "rejected special characters"
            );
            return Status::InvalidParameter;
        }
        Status::Success
    }

    /// Explicit DTR changes are refused while DTR is a handshake line.
    fn set_dtr_line(&self, set: bool) -> Status {
        self.synchronize(|hw| {
            if hw.hand_flow.dtr == DtrControl::Handshake {
                return Status::InvalidParameter;
            }
            if set {
                hw.set_dtr();
            } else {
                hw.clr_dtr();
            }
            Status::Success
        })
    }

    /// Explicit RTS changes are refused while the driver drives RTS itself.
    fn set_rts_line(&self, set: bool) -> Status {
        self.synchronize(|hw| {
            if matches!(
                hw.hand_flow.rts,
                RtsControl::Handshake | RtsControl::TransmitToggle
            ) {
                return Status::InvalidParameter;
            }
            if set {
                hw.set_rts();
            } else {
                hw.clr_rts();
            }
            Status::Success
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DtrControl;
    use crate::config::HandFlow;
    use crate::config::RtsControl;
    use crate::config::SerialChars;
    use crate::config::SerialConfig;
    use crate::config::Timeouts;
    use crate::deferred::MockTimeSource;
    use crate::protocol::PurgeFlags;
    use crate::request::Output;
    use crate::request::Request;
    use crate::request::RequestKind;
    use crate::request::Status;
    use crate::test_helpers::device_with;
    use crate::test_helpers::test_init;

    fn submit_now(device: &crate::SerialDevice, kind: RequestKind) -> Status {
        let (request, mut completion) = Request::new(kind);
        let status = device.submit(request);
        assert_eq!(completion.try_completion().unwrap().status, status);
        status
    }

    #[test]
    fn empty_transfers_complete_at_once() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        assert_eq!(submit_now(&device, RequestKind::Read { length: 0 }), Status::Success);
        assert_eq!(submit_now(&device, RequestKind::Write(Vec::new())), Status::Success);
        assert_eq!(
            submit_now(&device, RequestKind::Purge(PurgeFlags::new())),
            Status::InvalidParameter
        );
        assert_eq!(device.pending_requests(), 0);
    }

    #[test]
    fn shrinking_queue_size_is_a_no_op() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        assert_eq!(
            submit_now(&device, RequestKind::SetQueueSize { size: 16 }),
            Status::Success
        );
        device.inner.synchronize(|hw| assert_eq!(hw.buffer_size, 4096));
    }

    #[test]
    fn line_control_respects_handshake_modes() {
        test_init();
        let mut config = SerialConfig::default();
        config.hand_flow.dtr = DtrControl::Handshake;
        config.hand_flow.rts = RtsControl::TransmitToggle;
        let (device, uart, _time) = device_with(config, MockTimeSource::new());
        device.open();
        assert_eq!(submit_now(&device, RequestKind::ClrDtr), Status::InvalidParameter);
        assert_eq!(submit_now(&device, RequestKind::SetRts), Status::InvalidParameter);

        let hand_flow = HandFlow::new(4096);
        assert_eq!(submit_now(&device, RequestKind::SetHandFlow(hand_flow)), Status::Success);
        assert_eq!(submit_now(&device, RequestKind::ClrDtr), Status::Success);
        assert!(!uart.dtr());
        assert_eq!(submit_now(&device, RequestKind::SetDtr), Status::Success);
        assert!(uart.dtr());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        let mut hand_flow = HandFlow::new(4096);
        hand_flow.xon_limit = 5000;
        assert_eq!(
            submit_now(&device, RequestKind::SetHandFlow(hand_flow)),
            Status::InvalidParameter
        );

        let timeouts = Timeouts {
            read_interval: u32::MAX,
            read_total_multiplier: u32::MAX,
            read_total_constant: u32::MAX,
            ..Default::default()
        };
        assert_eq!(
            submit_now(&device, RequestKind::SetTimeouts(timeouts)),
            Status::InvalidParameter
        );

        let mut hand_flow = HandFlow::new(4096);
        hand_flow.auto_receive = true;
        assert_eq!(submit_now(&device, RequestKind::SetHandFlow(hand_flow)), Status::Success);
        let chars = SerialChars {
            xon: 0x11,
            xoff: 0x11,
            event: 0,
        };
        assert_eq!(submit_now(&device, RequestKind::SetChars(chars)), Status::InvalidParameter);
    }

    #[test]
    fn comm_status_is_returned_as_output() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        device.isr_receive(b'!');
        let (request, mut completion) = Request::new(RequestKind::GetCommStatus);
        assert_eq!(device.submit(request), Status::Success);
        let Output::CommStatus(status) = completion.try_completion().unwrap().output else {
            panic!("expected comm status");
        };
        assert_eq!(status.amount_in_in_queue, 1);
    }

    #[test]
    fn break_and_pretend_xoff() {
        test_init();
        let (device, uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        submit_now(&device, RequestKind::SetBreakOn);
        assert!(uart.break_enabled());
        submit_now(&device, RequestKind::SetBreakOff);
        assert!(!uart.break_enabled());

        submit_now(&device, RequestKind::SetXoff);
        device.inner.synchronize(|hw| assert!(hw.tx_holding.xoff()));
        submit_now(&device, RequestKind::SetXon);
        device.inner.synchronize(|hw| assert!(hw.tx_holding.is_empty()));
    }

    #[test]
    fn latched_error_cancels_with_error_abort() {
        test_init();
        let mut config = SerialConfig::default();
        config.hand_flow.error_abort = true;
        let (device, _uart, _time) = device_with(config, MockTimeSource::new());
        device.open();
        device.inner.synchronize(|hw| hw.error_word.set_parity(true));
        assert_eq!(submit_now(&device, RequestKind::Read { length: 1 }), Status::Cancelled);
        assert_eq!(submit_now(&device, RequestKind::Pnp), Status::Success);

        // The status query clears the latched error, so reads flow again.
        assert_eq!(submit_now(&device, RequestKind::GetCommStatus), Status::Success);
        let (read, mut completion) = Request::new(RequestKind::Read { length: 1 });
        assert_eq!(device.submit(read.clone()), Status::Pending);
        assert!(completion.try_completion().is_none());

        device.cancel(&read);
        assert_eq!(completion.try_completion().unwrap().status, Status::Cancelled);
        assert_eq!(device.pending_requests(), 0);
    }
}
