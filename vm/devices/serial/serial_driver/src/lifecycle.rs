// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-class queues, current slots, and the reference-counted completion
//! protocol.
//!
//! A request in a current slot may be claimed at the same time by its cancel
//! handler, its timers and the interrupt paths. Each claim is a bit in the
//! request's [`RequestRefs`]. Whoever drops the last bit completes the
//! request and starts the next one in its class.

use crate::deferred::Timer;
use crate::hw::Hw;
use crate::request::Location;
use crate::request::OpClass;
use crate::request::Request;
use crate::request::RequestKind;
use crate::request::RequestRefs;
use crate::request::Status;
use crate::DeviceInner;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// One current slot and the FIFO queue behind it.
#[derive(Debug, Default)]
pub(crate) struct OpQueue {
    pub current: Option<Request>,
    pub pending: VecDeque<Request>,
}

/// How the current read was finished, for an interval timer that fired too
/// late to be cancelled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    /// Still running. Holds the byte count seen at the last interval check.
    Counting(usize),
    /// Finished by another path with this status.
    Finished(Status),
}

/// Everything protected by the cancel lock.
#[derive(Debug)]
pub(crate) struct CancelState {
    read: OpQueue,
    write: OpQueue,
    immediate: OpQueue,
    mask: OpQueue,
    wait: OpQueue,
    purge: OpQueue,
    pub stalled: VecDeque<Request>,
    /// Bytes in queued and current writes, plus the immediate character.
    pub total_chars_queued: usize,
    pub read_progress: ReadProgress,
    pub last_read_time: Instant,
    pub read_interval: Duration,
}

impl CancelState {
    pub fn new(now: Instant) -> Self {
        Self {
            read: OpQueue::default(),
            write: OpQueue::default(),
            immediate: OpQueue::default(),
            mask: OpQueue::default(),
            wait: OpQueue::default(),
            purge: OpQueue::default(),
            stalled: VecDeque::new(),
            total_chars_queued: 0,
            read_progress: ReadProgress::Counting(0),
            last_read_time: now,
            read_interval: Duration::ZERO,
        }
    }

    pub fn queue(&self, class: OpClass) -> &OpQueue {
        match class {
            OpClass::Read => &self.read,
            OpClass::Write => &self.write,
            OpClass::Immediate => &self.immediate,
            OpClass::Mask => &self.mask,
            OpClass::Wait => &self.wait,
            OpClass::Purge => &self.purge,
        }
    }

    pub fn queue_mut(&mut self, class: OpClass) -> &mut OpQueue {
        match class {
            OpClass::Read => &mut self.read,
            OpClass::Write => &mut self.write,
            OpClass::Immediate => &mut self.immediate,
            OpClass::Mask => &mut self.mask,
            OpClass::Wait => &mut self.wait,
            OpClass::Purge => &mut self.purge,
        }
    }

    pub fn current(&self, class: OpClass) -> Option<Request> {
        self.queue(class).current.clone()
    }
}

impl OpClass {
    /// The interval and total timers owned by the current request of the
    /// class.
    fn timers(self) -> (Option<Timer>, Option<Timer>) {
        match self {
            OpClass::Read => (Some(Timer::ReadInterval), Some(Timer::ReadTotal)),
            OpClass::Write => (None, Some(Timer::WriteTotal)),
            OpClass::Immediate => (None, Some(Timer::ImmediateTotal)),
            OpClass::Mask | OpClass::Wait | OpClass::Purge => (None, None),
        }
    }

    /// The class feeds the transmitter and counts toward
    /// `total_chars_queued`.
    fn transmits(self) -> bool {
        matches!(self, OpClass::Write | OpClass::Immediate)
    }

    /// Takes the interrupt paths' claim off the current request of the
    /// class.
    fn grab_from_isr(self) -> Option<fn(&mut Hw<'_>)> {
        match self {
            OpClass::Read => Some(grab_read),
            OpClass::Write => Some(grab_write),
            OpClass::Immediate => Some(grab_immediate),
            OpClass::Wait => Some(grab_wait),
            OpClass::Mask | OpClass::Purge => None,
        }
    }
}

pub(crate) fn grab_read(hw: &mut Hw<'_>) {
    hw.grab_read_from_isr();
}

pub(crate) fn grab_write(hw: &mut Hw<'_>) {
    hw.grab_write_from_isr();
}

pub(crate) fn grab_immediate(hw: &mut Hw<'_>) {
    hw.grab_immediate_from_isr();
}

fn grab_wait(hw: &mut Hw<'_>) {
    hw.grab_wait_from_isr();
}

impl DeviceInner {
    /// Delivers `request`'s completion and retires it from the pending count.
    pub(crate) fn complete_request(&self, request: &Request) {
        if request.complete() {
            self.request_epilogue();
        }
    }

    /// Completes a request that never reached a queue.
    pub(crate) fn complete_with(&self, request: &Request, status: Status) -> Status {
        request.set_status(status);
        if matches!(status, Status::Cancelled | Status::DeletePending) {
            request.set_information(0);
        }
        self.complete_request(request);
        status
    }

    /// Starts `request` if its class is idle, otherwise queues it behind the
    /// others. Returns the starter's status or [`Status::Pending`].
    pub(crate) fn start_or_queue(&self, request: Request, class: OpClass) -> Status {
        let mut cancel = self.cancel.lock();
        if class == OpClass::Immediate && cancel.queue(class).current.is_some() {
            drop(cancel);
            tracing::debug!(
                port = %self.name,
                id = request.id(),
                "an immediate character is already pending"
            );
            return self.complete_with(&request, Status::InvalidParameter);
        }
        let chars = request.kind().queued_chars();
        if class.transmits() {
            cancel.total_chars_queued += chars;
        }

        let queue = cancel.queue_mut(class);
        if queue.current.is_none() && queue.pending.is_empty() {
            tracing::trace!(port = %self.name, id = request.id(), ?class, "starting request");
            request.set_location(Location::Current {
                class,
                cancelable: false,
            });
            queue.current = Some(request);
            drop(cancel);
            return self.start(class);
        }

        if request.is_cancel_requested() {
            if class.transmits() {
                cancel.total_chars_queued -= chars;
            }
            drop(cancel);
            request.take_side_buffer();
            return self.complete_with(&request, Status::Cancelled);
        }

        tracing::trace!(port = %self.name, id = request.id(), ?class, "queueing request");
        request.set_status(Status::Pending);
        request.set_location(Location::Queued(class));
        queue.pending.push_back(request);
        if class == OpClass::Write {
            self.queued_writes.fetch_add(1, Ordering::AcqRel);
        }
        Status::Pending
    }

    /// Moves the head of `class`'s queue into its current slot. The old
    /// current request is completed if `complete_current` is set; otherwise
    /// the caller has handed it elsewhere. Returns true if there is a new
    /// current request to start.
    pub(crate) fn get_next_request(
        &self,
        mut cancel: MutexGuard<'_, CancelState>,
        class: OpClass,
        complete_current: bool,
    ) -> bool {
        let queue = cancel.queue_mut(class);
        let old = queue.current.take();
        let next = queue.pending.pop_front();
        if let Some(next) = &next {
            next.set_location(Location::Current {
                class,
                cancelable: false,
            });
            queue.current = Some(next.clone());
            if class == OpClass::Write {
                self.queued_writes.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if class.transmits() {
            if let Some(old) = &old {
                cancel.total_chars_queued -= old.kind().queued_chars();
            }
        }
        drop(cancel);

        if complete_current {
            if let Some(old) = &old {
                self.complete_request(old);
            }
        }
        next.is_some()
    }

    /// Runs the starter for `class`. Called with no lock held and the new
    /// request already in the current slot.
    pub(crate) fn start(&self, class: OpClass) -> Status {
        match class {
            OpClass::Read => self.start_read(),
            OpClass::Write => self.start_write(),
            OpClass::Immediate => self.start_immediate(),
            OpClass::Mask => self.start_mask(),
            OpClass::Purge => self.start_purge(),
            OpClass::Wait => Status::Pending,
        }
    }

    /// Drops `reference` from the current request of `class`, then tries to
    /// drop every other claim on it. If none remain, the request completes
    /// with `status` and the next one in the class is started.
    pub(crate) fn try_to_complete_current(
        &self,
        cancel: MutexGuard<'_, CancelState>,
        class: OpClass,
        reference: RequestRefs,
        status: Status,
        sync: Option<fn(&mut Hw<'_>)>,
    ) {
        let Some(request) = cancel.current(class) else {
            tracing::error!(
                port = %self.name,
                ?class,
                ?reference,
                "no current request to complete"
            );
            return;
        };
        request.clear_reference(reference);
        if let Some(sync) = sync {
            self.synchronize(sync);
        }
        self.rundown_refs(&request, class);

        let references = request.references();
        if !references.is_empty() {
            tracing::trace!(
                port = %self.name,
                id = request.id(),
                ?references,
                "request still referenced"
            );
            return;
        }
        request.set_status(status);
        if status == Status::Cancelled {
            request.set_information(0);
        }
        if self.get_next_request(cancel, class, true) {
            self.start(class);
        }
    }

    /// Removes the claims that can be withdrawn without the cooperation of
    /// their owner: the cancel handler and any timer that has not fired.
    fn rundown_refs(&self, request: &Request, class: OpClass) {
        if let Location::Current {
            class,
            cancelable: true,
        } = request.location()
        {
            request.set_location(Location::Current {
                class,
                cancelable: false,
            });
            request.clear_reference(RequestRefs::CANCEL);
        }
        let (interval, total) = class.timers();
        if let Some(timer) = interval {
            if self.deferred.cancel_timer(timer) {
                request.clear_reference(RequestRefs::INT_TIMER);
            }
        }
        if let Some(timer) = total {
            if self.deferred.cancel_timer(timer) {
                request.clear_reference(RequestRefs::TOTAL_TIMER);
            }
        }
    }

    /// Installs the cancel handler on the current request of `class`.
    /// Returns false, installing nothing, if cancellation was already
    /// requested.
    pub(crate) fn make_cancelable(&self, request: &Request, class: OpClass) -> bool {
        if request.is_cancel_requested() {
            return false;
        }
        request.set_reference(RequestRefs::CANCEL);
        request.set_location(Location::Current {
            class,
            cancelable: true,
        });
        true
    }

    /// Cancels `request` according to where it currently is.
    pub(crate) fn cancel_request(&self, request: &Request) {
        request.set_cancel_flag();
        let mut cancel = self.cancel.lock();
        match request.location() {
            Location::Dispatch | Location::Completed => {}
            Location::Current {
                cancelable: false, ..
            } => {
                tracing::trace!(
                    port = %self.name,
                    id = request.id(),
                    "cancel flagged on current request"
                );
            }
            Location::Queued(class) => {
                let queue = &mut cancel.queue_mut(class).pending;
                let Some(index) = queue.iter().position(|r| r.same(request)) else {
                    tracing::error!(
                        port = %self.name,
                        id = request.id(),
                        ?class,
                        "queued request missing"
                    );
                    return;
                };
                queue.remove(index);
                if class == OpClass::Write {
                    cancel.total_chars_queued -= request.kind().queued_chars();
                    self.queued_writes.fetch_sub(1, Ordering::AcqRel);
                }
                drop(cancel);
                tracing::debug!(
                    port = %self.name,
                    id = request.id(),
                    ?class,
                    "cancelled queued request"
                );
                request.take_side_buffer();
                self.complete_with(request, Status::Cancelled);
            }
            Location::Stalled => {
                let Some(index) = cancel.stalled.iter().position(|r| r.same(request)) else {
                    tracing::error!(
                        port = %self.name,
                        id = request.id(),
                        "stalled request missing"
                    );
                    return;
                };
                cancel.stalled.remove(index);
                drop(cancel);
                tracing::debug!(port = %self.name, id = request.id(), "cancelled stalled request");
                self.complete_with(request, Status::Cancelled);
            }
            Location::Current {
                class,
                cancelable: true,
            } => {
                let is_current = cancel
                    .current(class)
                    .is_some_and(|current| current.same(request));
                if !is_current {
                    tracing::error!(
                        port = %self.name,
                        id = request.id(),
                        ?class,
                        "cancelable request not current"
                    );
                    debug_assert!(is_current);
                    return;
                }
                // The handler is consumed by this cancellation.
                request.set_location(Location::Current {
                    class,
                    cancelable: false,
                });
                if class == OpClass::Read {
                    cancel.read_progress = ReadProgress::Finished(Status::Cancelled);
                }
                tracing::debug!(
                    port = %self.name,
                    id = request.id(),
                    ?class,
                    "cancelling current request"
                );
                self.try_to_complete_current(
                    cancel,
                    class,
                    RequestRefs::CANCEL,
                    Status::Cancelled,
                    class.grab_from_isr(),
                );
            }
        }
    }

    /// Cancels `request` if a line error is latched and abort-on-error is
    /// set. Status queries and PnP/power requests always pass.
    pub(crate) fn complete_if_error(&self, request: &Request) -> bool {
        if matches!(
            request.kind(),
            RequestKind::GetCommStatus | RequestKind::Pnp | RequestKind::Power
        ) {
            return false;
        }
        let abort = self.synchronize(|hw| hw.hand_flow.error_abort && !hw.error_word.is_empty());
        if abort {
            tracing::debug!(
                port = %self.name,
                id = request.id(),
                "error latched, cancelling request"
            );
            self.complete_with(request, Status::Cancelled);
        }
        abort
    }

    /// Cancels every queued request of `class`, newest first, then the
    /// current one.
    pub(crate) fn kill_all_reads_or_writes(&self, class: OpClass) {
        loop {
            let last = self.cancel.lock().queue(class).pending.back().cloned();
            let Some(last) = last else {
                break;
            };
            self.cancel_request(&last);
        }
        let current = self.cancel.lock().current(class);
        if let Some(current) = current {
            self.cancel_request(&current);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SerialConfig;
    use crate::deferred::MockTimeSource;
    use crate::request::Location;
    use crate::request::OpClass;
    use crate::request::Output;
    use crate::request::Request;
    use crate::request::RequestKind;
    use crate::request::RequestRefs;
    use crate::request::Status;
    use crate::test_helpers::device_with;
    use crate::test_helpers::test_init;

    #[test]
    fn completion_waits_for_every_reference() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        let inner = &device.inner;
        let (request, mut completion) = Request::new(RequestKind::Purge(Default::default()));
        inner.pending_requests.increment();
        {
            let mut cancel = inner.cancel.lock();
            request.set_location(Location::Current {
                class: OpClass::Purge,
                cancelable: false,
            });
            cancel.queue_mut(OpClass::Purge).current = Some(request.clone());
        }
        request.set_reference(RequestRefs::ISR);
        request.set_reference(RequestRefs::XOFF);

        inner.try_to_complete_current(
            inner.cancel.lock(),
            OpClass::Purge,
            RequestRefs::ISR,
            Status::Success,
            None,
        );
        assert!(completion.try_completion().is_none());
        assert_eq!(request.references(), RequestRefs::XOFF);

        inner.try_to_complete_current(
            inner.cancel.lock(),
            OpClass::Purge,
            RequestRefs::XOFF,
            Status::Timeout,
            None,
        );
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Timeout);
        assert_eq!(result.output, Output::None);
        assert!(inner.cancel.lock().current(OpClass::Purge).is_none());
        assert_eq!(device.pending_requests(), 0);
    }

    #[test]
    fn cancelled_while_queued_never_becomes_current() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (first, _c1) = Request::new(RequestKind::Write(b"abc".to_vec()));
        let (second, mut c2) = Request::new(RequestKind::Write(b"de".to_vec()));
        assert_eq!(device.submit(first.clone()), Status::Pending);
        assert_eq!(device.submit(second.clone()), Status::Pending);
        assert_eq!(second.location(), Location::Queued(OpClass::Write));
        assert_eq!(device.inner.cancel.lock().total_chars_queued, 5);

        device.cancel(&second);
        let result = c2.try_completion().unwrap();
        assert_eq!(result.status, Status::Cancelled);
        assert_eq!(result.information, 0);
        assert_eq!(device.inner.cancel.lock().total_chars_queued, 3);
        assert!(device.inner.cancel.lock().current(OpClass::Write).unwrap().same(&first));
    }

    #[test]
    fn already_cancelled_request_is_not_queued() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let (first, _c1) = Request::new(RequestKind::Write(b"abc".to_vec()));
        let (second, mut c2) = Request::new(RequestKind::Write(b"de".to_vec()));
        device.submit(first);
        second.set_cancel_flag();
        assert_eq!(device.submit(second), Status::Cancelled);
        assert_eq!(c2.try_completion().unwrap().status, Status::Cancelled);
        assert_eq!(device.inner.cancel.lock().total_chars_queued, 3);
    }

    #[test]
    fn kill_all_cancels_back_to_front() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.open();
        let mut completions = Vec::new();
        for _ in 0..3 {
            let (request, completion) = Request::new(RequestKind::Read { length: 4 });
            device.submit(request);
            completions.push(completion);
        }
        device.inner.kill_all_reads_or_writes(OpClass::Read);
        for mut completion in completions {
            assert_eq!(completion.try_completion().unwrap().status, Status::Cancelled);
        }
        assert!(device.inner.cancel.lock().current(OpClass::Read).is_none());
        assert_eq!(device.pending_requests(), 0);
        assert_eq!(device.outstanding_deferred(), 0);
    }
}
