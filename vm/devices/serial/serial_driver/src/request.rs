// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Requests, their reference bits and their one-shot completion.

use crate::config::HandFlow;
use crate::config::SerialChars;
use crate::config::Timeouts;
use crate::protocol::CommStatus;
use crate::protocol::PurgeFlags;
use crate::protocol::WaitMask;
use bitfield_struct::bitfield;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::ready;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;

/// The outcome of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The operation finished.
    Success,
    /// The operation has been accepted and will complete later.
    Pending,
    /// The operation was cancelled.
    Cancelled,
    /// The device is going away and no longer accepts requests.
    DeletePending,
    /// A read or write timeout expired.
    Timeout,
    /// A buffer needed by the request could not be allocated.
    InsufficientResources,
    /// The request is malformed or not allowed in the current state.
    InvalidParameter,
    /// The hardware reported a failure.
    HardwareFailure,
}

/// Failure to allocate a request-owned buffer.
#[derive(Debug, Error)]
#[error("failed to allocate {size} byte buffer")]
pub struct AllocationError {
    /// The requested size.
    pub size: usize,
    #[source]
    source: std::collections::TryReserveError,
}

impl From<AllocationError> for Status {
    fn from(_: AllocationError) -> Self {
        Status::InsufficientResources
    }
}

/// What a request asks the device to do.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Read up to `length` bytes.
    Read {
        /// Bytes wanted.
        length: usize,
    },
    /// Transmit the given bytes.
    Write(Vec<u8>),
    /// Transmit one byte ahead of any queued write data.
    ImmediateChar(u8),
    /// Grow the receive interrupt buffer.
    SetQueueSize {
        /// New buffer size in bytes.
        size: usize,
    },
    /// Replace the set of events waits are satisfied by.
    SetWaitMask(WaitMask),
    /// Wait for one of the enabled events.
    WaitOnMask,
    /// Abort and/or discard queued data.
    Purge(PurgeFlags),
    /// Query and clear the error word.
    GetCommStatus,
    /// Replace the flow control policy.
    SetHandFlow(HandFlow),
    /// Replace the timeouts.
    SetTimeouts(Timeouts),
    /// Replace the special characters.
    SetChars(SerialChars),
    /// Raise DTR.
    SetDtr,
    /// Lower DTR.
    ClrDtr,
    /// Raise RTS.
    SetRts,
    /// Lower RTS.
    ClrRts,
    /// Start sending a break.
    SetBreakOn,
    /// Stop sending a break.
    SetBreakOff,
    /// Act as if an XOFF was received.
    SetXoff,
    /// Act as if an XON was received.
    SetXon,
    /// A plug and play request, owned by the PnP layer.
    Pnp,
    /// A power request, owned by the power manager.
    Power,
}

impl RequestKind {
    /// Bytes this request adds to the transmit backlog while queued.
    pub(crate) fn queued_chars(&self) -> usize {
        match self {
            RequestKind::Write(data) => data.len(),
            RequestKind::ImmediateChar(_) => 1,
            _ => 0,
        }
    }
}

/// Reasons a request cannot be completed yet.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct RequestRefs {
    pub isr: bool,
    pub cancel: bool,
    pub total_timer: bool,
    pub int_timer: bool,
    pub xoff: bool,
    #[bits(27)]
    _reserved: u32,
}

impl RequestRefs {
    /// The data-transfer path owns the request.
    pub const ISR: Self = Self::new().with_isr(true);
    /// A cancel handler is installed.
    pub const CANCEL: Self = Self::new().with_cancel(true);
    /// The total timer is armed.
    pub const TOTAL_TIMER: Self = Self::new().with_total_timer(true);
    /// The interval timer is armed.
    pub const INT_TIMER: Self = Self::new().with_int_timer(true);
    /// An XOFF counter owns the request.
    pub const XOFF: Self = Self::new().with_xoff(true);

    /// True if no reference is held.
    pub fn is_empty(&self) -> bool {
        u32::from(*self) == 0
    }
}

/// A class of operations sharing one queue and one current slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpClass {
    /// Reads and queue-size changes.
    Read,
    /// Writes.
    Write,
    /// The one pending immediate character. It has no queue: a second one
    /// is refused while the first is outstanding.
    Immediate,
    /// Wait-mask changes and wait requests on their way to the wait slot.
    Mask,
    /// The one outstanding wait-on-mask request.
    Wait,
    /// Purges.
    Purge,
}

/// Where a request currently lives. Changed only under the cancel lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    /// Being dispatched, owned by the caller's stack.
    Dispatch,
    /// Waiting in the queue of a class.
    Queued(OpClass),
    /// Parked by the admission gate.
    Stalled,
    /// In the current slot of a class. `cancelable` is set while a cancel
    /// handler (and its `CANCEL` reference) is installed.
    Current { class: OpClass, cancelable: bool },
    /// Completed.
    Completed,
}

/// Data returned with a completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Output {
    /// Nothing beyond the status.
    #[default]
    None,
    /// Bytes read.
    Data(Vec<u8>),
    /// Events that satisfied a wait.
    Events(WaitMask),
    /// Result of a status query.
    CommStatus(CommStatus),
}

/// The terminal result of a request, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Final status.
    pub status: Status,
    /// Bytes transferred.
    pub information: usize,
    /// Returned data.
    pub output: Output,
}

/// The caller's handle to a request's completion.
#[derive(Debug)]
#[must_use]
pub struct RequestCompletion(oneshot::Receiver<Completion>);

impl RequestCompletion {
    /// Returns the completion if it has been delivered.
    pub fn try_completion(&mut self) -> Option<Completion> {
        self.0.try_recv().ok().flatten()
    }
}

impl Future for RequestCompletion {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let completion = ready!(Pin::new(&mut self.0).poll(cx)).unwrap_or_else(|_| {
            tracing::error!("request dropped without completion");
            Completion {
                status: Status::Cancelled,
                information: 0,
                output: Output::None,
            }
        });
        Poll::Ready(completion)
    }
}

/// A shared handle to an in-flight request.
#[derive(Debug, Clone)]
pub struct Request(Arc<RequestInner>);

#[derive(Debug)]
struct RequestInner {
    id: u64,
    kind: RequestKind,
    cancel: AtomicBool,
    references: AtomicU32,
    state: Mutex<RequestState>,
}

#[derive(Debug)]
struct RequestState {
    location: Location,
    status: Status,
    information: usize,
    length: usize,
    data: Vec<u8>,
    output: Output,
    side_buffer: Option<Vec<u8>>,
    sender: Option<oneshot::Sender<Completion>>,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl Request {
    /// Creates a request and the handle its completion is delivered to.
    pub fn new(kind: RequestKind) -> (Self, RequestCompletion) {
        let (sender, receiver) = oneshot::channel();
        let length = match &kind {
            RequestKind::Read { length } => *length,
            _ => 0,
        };
        let request = Self(Arc::new(RequestInner {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            cancel: AtomicBool::new(false),
            references: AtomicU32::new(0),
            state: Mutex::new(RequestState {
                location: Location::Dispatch,
                status: Status::Pending,
                information: 0,
                length,
                data: Vec::new(),
                output: Output::None,
                side_buffer: None,
                sender: Some(sender),
            }),
        }));
        (request, RequestCompletion(receiver))
    }

    /// A process-unique identifier, for logs.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// The operation requested.
    pub fn kind(&self) -> &RequestKind {
        &self.0.kind
    }

    /// True once cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.0.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn set_cancel_flag(&self) {
        self.0.cancel.store(true, Ordering::Release);
    }

    pub(crate) fn same(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Bytes to transmit for write-class requests.
    pub(crate) fn write_data(&self) -> &[u8] {
        match &self.0.kind {
            RequestKind::Write(data) => data,
            RequestKind::ImmediateChar(c) => std::slice::from_ref(c),
            _ => &[],
        }
    }

    pub(crate) fn set_reference(&self, reference: RequestRefs) {
        let old = self
            .0
            .references
            .fetch_or(reference.into(), Ordering::AcqRel);
        let overlap = old & u32::from(reference);
        if overlap != 0 {
            tracing::error!(id = self.id(), ?reference, "reference already held");
        }
        debug_assert_eq!(overlap, 0, "reference set twice");
    }

    pub(crate) fn clear_reference(&self, reference: RequestRefs) {
        let old = self
            .0
            .references
            .fetch_and(!u32::from(reference), Ordering::AcqRel);
        let missing = u32::from(reference) & !old;
        if missing != 0 {
            tracing::error!(id = self.id(), ?reference, "clearing a reference not held");
        }
        debug_assert_eq!(missing, 0, "reference cleared twice");
    }

    /// The references currently held.
    pub fn references(&self) -> RequestRefs {
        RequestRefs::from(self.0.references.load(Ordering::Acquire))
    }

    pub(crate) fn has_reference(&self, reference: RequestRefs) -> bool {
        u32::from(self.references()) & u32::from(reference) != 0
    }

    pub(crate) fn location(&self) -> Location {
        self.0.state.lock().location
    }

    pub(crate) fn set_location(&self, location: Location) {
        self.0.state.lock().location = location;
    }

    pub(crate) fn status(&self) -> Status {
        self.0.state.lock().status
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.0.state.lock().status = status;
    }

    pub(crate) fn information(&self) -> usize {
        self.0.state.lock().information
    }

    pub(crate) fn set_information(&self, information: usize) {
        self.0.state.lock().information = information;
    }

    /// Bytes a read asked for.
    pub(crate) fn read_length(&self) -> usize {
        self.0.state.lock().length
    }

    /// Appends received bytes and returns the total now held.
    pub(crate) fn push_data(&self, bytes: &[u8]) -> usize {
        let mut state = self.0.state.lock();
        state.data.extend_from_slice(bytes);
        state.information = state.data.len();
        state.data.len()
    }

    pub(crate) fn data_len(&self) -> usize {
        self.0.state.lock().data.len()
    }

    pub(crate) fn set_output(&self, output: Output) {
        self.0.state.lock().output = output;
    }

    /// Allocates the replacement buffer a queue-size change carries.
    pub(crate) fn allocate_side_buffer(&self, size: usize) -> Result<(), AllocationError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|source| AllocationError { size, source })?;
        self.0.state.lock().side_buffer = Some(buffer);
        Ok(())
    }

    pub(crate) fn take_side_buffer(&self) -> Option<Vec<u8>> {
        self.0.state.lock().side_buffer.take()
    }

    /// Delivers the completion. Returns false if the request had already
    /// been completed.
    pub(crate) fn complete(&self) -> bool {
        let mut state = self.0.state.lock();
        let sender = state.sender.take();
        debug_assert!(sender.is_some(), "request completed twice");
        let Some(sender) = sender else {
            tracing::error!(id = self.id(), "request completed twice");
            return false;
        };
        let references = self.references();
        if !references.is_empty() {
            tracing::error!(id = self.id(), ?references, "completing a referenced request");
        }
        debug_assert!(references.is_empty());
        state.location = Location::Completed;
        state.side_buffer = None;
        let output = match std::mem::take(&mut state.output) {
            Output::None if matches!(self.0.kind, RequestKind::Read { .. }) => {
                let mut data = std::mem::take(&mut state.data);
                data.truncate(state.information);
                Output::Data(data)
            }
            output => output,
        };
        let completion = Completion {
            status: state.status,
            information: state.information,
            output,
        };
        drop(state);
        tracing::trace!(id = self.id(), status = ?completion.status, "request completed");
        // The receiver may have been dropped; that is not an error.
        let _ = sender.send(completion);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_a_tagged_set() {
        let (request, _completion) = Request::new(RequestKind::Read { length: 4 });
        assert!(request.references().is_empty());
        request.set_reference(RequestRefs::ISR);
        request.set_reference(RequestRefs::CANCEL);
        assert!(request.has_reference(RequestRefs::ISR));
        assert_eq!(request.references().into_bits().count_ones(), 2);
        request.clear_reference(RequestRefs::ISR);
        request.clear_reference(RequestRefs::CANCEL);
        assert!(request.references().is_empty());
    }

    #[test]
    fn completes_exactly_once() {
        let (request, mut completion) = Request::new(RequestKind::Read { length: 4 });
        assert!(completion.try_completion().is_none());
        request.push_data(b"ab");
        request.set_status(Status::Timeout);
        assert!(request.complete());
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::Timeout);
        assert_eq!(result.information, 2);
        assert_eq!(result.output, Output::Data(b"ab".to_vec()));
        assert_eq!(request.location(), Location::Completed);
    }

    #[test]
    fn completion_is_a_future() {
        let (request, completion) = Request::new(RequestKind::GetCommStatus);
        request.set_status(Status::Success);
        request.complete();
        let result = futures::executor::block_on(completion);
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.output, Output::None);
    }

    #[test]
    fn write_data() {
        let (write, _c1) = Request::new(RequestKind::Write(b"xyz".to_vec()));
        let (immediate, _c2) = Request::new(RequestKind::ImmediateChar(b'!'));
        assert_eq!(write.write_data(), b"xyz");
        assert_eq!(immediate.write_data(), b"!");
        assert_eq!(write.kind().queued_chars(), 3);
        assert_eq!(immediate.kind().queued_chars(), 1);
    }

    #[test]
    fn side_buffer_allocation() {
        let (request, _completion) = Request::new(RequestKind::SetQueueSize { size: 64 });
        request.allocate_side_buffer(64).unwrap();
        assert!(request.take_side_buffer().unwrap().capacity() >= 64);
        assert!(request.take_side_buffer().is_none());
        assert!(request.allocate_side_buffer(usize::MAX).is_err());
    }
}
