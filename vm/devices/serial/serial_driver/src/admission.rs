// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The PnP admission gate.
//!
//! Every request passes [`SerialDevice::submit`]'s gate before it reaches a
//! queue. While the device is stopping or powering down, ordinary requests
//! are parked on the stall list and replayed by
//! [`SerialDevice::unstall_requests`]. Once the device is being removed, or
//! its hardware is broken, they are rejected.

use crate::error_log::ErrorLogEntry;
use crate::error_log::BROKEN_HARDWARE_ERROR_VALUE;
use crate::request::Location;
use crate::request::Request;
use crate::request::RequestKind;
use crate::request::Status;
use crate::DeviceInner;
use crate::SerialDevice;
use bitfield_struct::bitfield;

/// Which requests the PnP state lets through. All clear means everything.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PnpAccept {
    /// The device is being removed.
    pub removing: bool,
    /// A stop is in progress.
    pub stopping: bool,
    /// The device is stopped.
    pub stopped: bool,
    /// The device disappeared without warning.
    pub surprise_removing: bool,
    /// The device is leaving D0.
    pub power_down: bool,
    #[bits(27)]
    _reserved: u32,
}

impl PnpAccept {
    /// True if nothing restricts admission.
    pub fn is_ok(&self) -> bool {
        u32::from(*self) == 0
    }

    fn rejects(&self) -> bool {
        self.removing() || self.surprise_removing()
    }

    fn stalls(&self) -> bool {
        self.stopping() || self.power_down()
    }
}

/// Device lifecycle flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct DeviceFlags {
    /// The device has been started.
    pub started: bool,
    /// The device has been stopped.
    pub stopped: bool,
    /// Set once by [`SerialDevice::mark_hardware_broken`], never cleared.
    pub broken_hw: bool,
    #[bits(29)]
    _reserved: u32,
}

/// Everything protected by the flags lock.
#[derive(Debug, Default)]
pub(crate) struct PnpState {
    pub accept: PnpAccept,
    pub flags: DeviceFlags,
}

/// The gate's verdict on one request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Accepted,
    /// Parked on the stall list; the device owns it until it is replayed.
    Stalled,
    Rejected(Status),
}

impl DeviceInner {
    /// Counts a request entering dispatch.
    pub(crate) fn request_prologue(&self, request: &Request) {
        let pending = self.pending_requests.increment();
        tracing::trace!(port = %self.name, id = request.id(), pending, "request admitted");
    }

    /// Counts a request leaving the device for good.
    pub(crate) fn request_epilogue(&self) {
        self.pending_requests.decrement();
    }

    /// Decides whether `request` may proceed given the PnP state.
    pub(crate) fn filter(&self, request: &Request) -> Admission {
        let state = self.pnp_state.lock();
        let accept = state.accept;
        let broken = state.flags.broken_hw();
        drop(state);

        if accept.is_ok() && !broken {
            return Admission::Accepted;
        }
        let is_pnp = matches!(request.kind(), RequestKind::Pnp);
        if accept.rejects() || broken {
            if is_pnp {
                return Admission::Accepted;
            }
            tracing::debug!(port = %self.name, id = request.id(), "rejecting request");
            return Admission::Rejected(Status::DeletePending);
        }
        if accept.stalls() {
            let is_power = matches!(request.kind(), RequestKind::Power);
            if is_pnp || (is_power && accept.power_down()) {
                return Admission::Accepted;
            }
            let mut cancel = self.cancel.lock();
            if request.is_cancel_requested() {
                return Admission::Rejected(Status::Cancelled);
            }
            request.set_status(Status::Pending);
            request.set_location(Location::Stalled);
            cancel.stalled.push_back(request.clone());
            tracing::debug!(port = %self.name, id = request.id(), "stalling request");
            return Admission::Stalled;
        }
        Admission::Accepted
    }

    /// Replays stalled requests through the gate and router, oldest first.
    /// Requests stalled again stay on the list.
    pub(crate) fn unstall_requests(&self) {
        let mut replayed = 0usize;
        loop {
            let request = {
                let mut cancel = self.cancel.lock();
                let Some(request) = cancel.stalled.pop_front() else {
                    break;
                };
                request.set_location(Location::Dispatch);
                request
            };
            tracing::debug!(port = %self.name, id = request.id(), "unstalling request");
            replayed += 1;
            if self.admit_and_route(request) == Status::Pending {
                // A request stalled again means the device stopped again.
                if self.pnp_state.lock().accept.stalls() {
                    break;
                }
            }
        }
        tracing::debug!(port = %self.name, replayed, "unstall finished");
    }

    /// Cancels every stalled request, newest first.
    pub(crate) fn kill_all_stalled(&self) {
        loop {
            let last = self.cancel.lock().stalled.back().cloned();
            let Some(last) = last else {
                break;
            };
            self.cancel_request(&last);
        }
    }

    /// Declares the hardware broken. Admission rejects everything but PnP
    /// from now on.
    pub(crate) fn mark_hardware_broken(&self) {
        let already = {
            let mut state = self.pnp_state.lock();
            let already = state.flags.broken_hw();
            state.flags.set_broken_hw(true);
            already
        };
        if already {
            tracing::debug!(port = %self.name, "hardware already marked broken");
            return;
        }
        tracing::error!(port = %self.name, "hardware marked broken");
        self.error_log.write_entry(ErrorLogEntry {
            device: self.name.clone(),
            unique_error_value: BROKEN_HARDWARE_ERROR_VALUE,
            major_function: None,
            retry_count: 0,
            final_status: Status::Success,
            specific_status: Status::HardwareFailure,
            insertions: vec![self.name.clone()],
            dump_data: Vec::new(),
        });
        self.pnp.invalidate_device_state(&self.name);
    }
}

impl SerialDevice {
    /// Sets `bits` in the PnP accept state.
    pub fn set_pnp_accept(&self, bits: PnpAccept) {
        let mut state = self.inner.pnp_state.lock();
        state.accept = PnpAccept::from(u32::from(state.accept) | u32::from(bits));
        tracing::info!(port = %self.inner.name, accept = ?state.accept, "pnp accept set");
    }

    /// Clears `bits` from the PnP accept state.
    pub fn clear_pnp_accept(&self, bits: PnpAccept) {
        let mut state = self.inner.pnp_state.lock();
        state.accept = PnpAccept::from(u32::from(state.accept) & !u32::from(bits));
        tracing::info!(port = %self.inner.name, accept = ?state.accept, "pnp accept cleared");
    }

    /// The current PnP accept state.
    pub fn pnp_accept(&self) -> PnpAccept {
        self.inner.pnp_state.lock().accept
    }

    /// Sets or clears `flags`. The broken hardware flag can only be set
    /// through [`Self::mark_hardware_broken`] and is never cleared.
    pub fn set_device_flags(&self, flags: DeviceFlags, set: bool) {
        let flags = flags.with_broken_hw(false);
        let mut state = self.inner.pnp_state.lock();
        let bits = u32::from(state.flags);
        let bits = if set {
            bits | u32::from(flags)
        } else {
            bits & !u32::from(flags)
        };
        state.flags = DeviceFlags::from(bits);
        tracing::info!(port = %self.inner.name, flags = ?state.flags, "device flags updated");
    }

    /// The current device flags.
    pub fn device_flags(&self) -> DeviceFlags {
        self.inner.pnp_state.lock().flags
    }

    /// Replays every request stalled while the device was stopping.
    pub fn unstall_requests(&self) {
        self.inner.unstall_requests();
    }

    /// Cancels every stalled request.
    pub fn kill_all_stalled(&self) {
        self.inner.kill_all_stalled();
    }

    /// Declares the hardware broken: logs a diagnostic record and asks the
    /// PnP manager to re-query the device. One-way.
    pub fn mark_hardware_broken(&self) {
        self.inner.mark_hardware_broken();
    }

    /// True once [`Self::mark_hardware_broken`] has been called.
    pub fn is_hardware_broken(&self) -> bool {
        self.inner.pnp_state.lock().flags.broken_hw()
    }
}

#[cfg(test)]
mod tests {
    use super::PnpAccept;
    use crate::config::SerialConfig;
    use crate::deferred::MockTimeSource;
    use crate::error_log::BROKEN_HARDWARE_ERROR_VALUE;
    use crate::request::Location;
    use crate::request::Request;
    use crate::request::RequestKind;
    use crate::request::Status;
    use crate::test_helpers::device_with;
    use crate::test_helpers::device_with_log;
    use crate::test_helpers::test_init;

    #[test]
    fn stopping_stalls_everything_but_pnp() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.set_pnp_accept(PnpAccept::new().with_stopping(true));

        let (read, mut completion) = Request::new(RequestKind::Read { length: 1 });
        assert_eq!(device.submit(read.clone()), Status::Pending);
        assert_eq!(read.location(), Location::Stalled);
        assert_eq!(device.pending_requests(), 1);

        let (pnp, mut pnp_completion) = Request::new(RequestKind::Pnp);
        assert_eq!(device.submit(pnp), Status::Success);
        assert_eq!(pnp_completion.try_completion().unwrap().status, Status::Success);

        let (power, _c) = Request::new(RequestKind::Power);
        assert_eq!(device.submit(power), Status::Pending);

        device.kill_all_stalled();
        assert_eq!(completion.try_completion().unwrap().status, Status::Cancelled);
        assert_eq!(device.pending_requests(), 0);
    }

    #[test]
    fn power_down_admits_power_requests() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.set_pnp_accept(PnpAccept::new().with_power_down(true));
        let (power, _c) = Request::new(RequestKind::Power);
        assert_eq!(device.submit(power), Status::Success);
    }

    #[test]
    fn cancelled_request_is_not_stalled() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.set_pnp_accept(PnpAccept::new().with_stopping(true));
        let (read, mut completion) = Request::new(RequestKind::Read { length: 1 });
        read.set_cancel_flag();
        assert_eq!(device.submit(read), Status::Cancelled);
        assert_eq!(completion.try_completion().unwrap().status, Status::Cancelled);
        assert!(device.inner.cancel.lock().stalled.is_empty());
    }

    #[test]
    fn cancelling_a_stalled_request_removes_it() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.set_pnp_accept(PnpAccept::new().with_stopping(true));
        let (first, mut c1) = Request::new(RequestKind::Read { length: 1 });
        let (second, _c2) = Request::new(RequestKind::Read { length: 1 });
        device.submit(first.clone());
        device.submit(second.clone());
        device.cancel(&first);
        assert_eq!(c1.try_completion().unwrap().status, Status::Cancelled);
        let cancel = device.inner.cancel.lock();
        assert_eq!(cancel.stalled.len(), 1);
        assert!(cancel.stalled[0].same(&second));
    }

    #[test]
    fn removal_rejects_with_delete_pending() {
        test_init();
        let (device, _uart, _time) = device_with(SerialConfig::default(), MockTimeSource::new());
        device.set_pnp_accept(PnpAccept::new().with_removing(true));
        let (write, mut completion) = Request::new(RequestKind::Write(b"x".to_vec()));
        assert_eq!(device.submit(write), Status::DeletePending);
        let result = completion.try_completion().unwrap();
        assert_eq!(result.status, Status::DeletePending);
        assert_eq!(result.information, 0);
        assert_eq!(device.pending_requests(), 0);

        device.clear_pnp_accept(PnpAccept::new().with_removing(true));
        assert!(device.pnp_accept().is_ok());
    }

    #[test]
    fn broken_hardware_is_logged_once_and_sticks() {
        test_init();
        let (device, _uart, _time, log) =
            device_with_log(SerialConfig::default(), MockTimeSource::new());
        device.mark_hardware_broken();
        device.mark_hardware_broken();
        assert!(device.is_hardware_broken());

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unique_error_value, BROKEN_HARDWARE_ERROR_VALUE);
        assert_eq!(entries[0].specific_status, Status::HardwareFailure);
        assert_eq!(entries[0].insertions, ["COM1"]);

        device.set_device_flags(device.device_flags(), false);
        assert!(device.is_hardware_broken());

        let (pnp, _c) = Request::new(RequestKind::Pnp);
        assert_eq!(device.submit(pnp), Status::Success);
        let (read, _c) = Request::new(RequestKind::Read { length: 1 });
        assert_eq!(device.submit(read), Status::DeletePending);
    }
}
