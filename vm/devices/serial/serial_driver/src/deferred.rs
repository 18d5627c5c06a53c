// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred procedure calls, timers and the outstanding-work accounting
//! that tells teardown when the device is quiescent.
//!
//! Work scheduled from hardware-lock context cannot take the cancel lock, so
//! it is pushed here and run later by [`SerialDevice::run_deferred`], either
//! from a test or from a [`DpcWorker`] thread. Every queued DPC and every
//! armed timer holds one unit of the outstanding-work count until its routine
//! has run (or the timer is cancelled).
//!
//! [`SerialDevice::run_deferred`]: crate::SerialDevice::run_deferred

use crate::SerialDevice;
use event_listener::Event;
use event_listener::Listener;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicIsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

/// A source of monotonic time for timers.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Instant;
}

/// A [`TimeSource`] backed by [`Instant::now`].
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A [`TimeSource`] that only moves when told to. Clones share one clock.
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    now: Arc<Mutex<Instant>>,
}

impl MockTimeSource {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for MockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Deferred routines queued directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dpc {
    /// Completes a read the receive path finished.
    CompleteRead,
    /// Completes a write the transmit path finished.
    CompleteWrite,
    /// Completes an immediate character the transmit path sent.
    CompleteImmediate,
    /// Completes a satisfied wait-on-mask request.
    CommWait,
    /// Cancels all reads and writes after a line error.
    CommError,
    /// Writes a diagnostic record for line errors seen by the interrupt
    /// paths.
    LogLineErrors,
    /// Arms the RTS lowering timer.
    StartTimerLowerRts,
}

/// Deferred routines run when a timer expires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timer {
    /// The total timeout of the current read.
    ReadTotal,
    /// The inter-character timeout of the current read.
    ReadInterval,
    /// The total timeout of the current write.
    WriteTotal,
    /// The total timeout of the pending immediate character.
    ImmediateTotal,
    /// One character time after a transmit-toggle RTS lowering attempt.
    LowerRts,
}

impl Timer {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            Timer::ReadTotal => 0,
            Timer::ReadInterval => 1,
            Timer::WriteTotal => 2,
            Timer::ImmediateTotal => 3,
            Timer::LowerRts => 4,
        }
    }

    const ALL: [Timer; Timer::COUNT] = [
        Timer::ReadTotal,
        Timer::ReadInterval,
        Timer::WriteTotal,
        Timer::ImmediateTotal,
        Timer::LowerRts,
    ];
}

/// A unit of ready deferred work.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Routine {
    Dpc(Dpc),
    Timer(Timer),
}

/// A non-negative count with a "reached zero" notification.
#[derive(Debug)]
pub(crate) struct QuiescentCounter {
    name: &'static str,
    count: AtomicIsize,
    event: Event,
}

impl QuiescentCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: AtomicIsize::new(0),
            event: Event::new(),
        }
    }

    pub fn increment(&self) -> isize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decrement(&self) -> isize {
        let count = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if count < 0 {
            tracing::error!(counter = self.name, count, "counter underflow");
        }
        debug_assert!(count >= 0, "{} underflow", self.name);
        if count == 0 {
            self.event.notify(usize::MAX);
        }
        count
    }

    pub fn get(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }

    /// Blocks until the count is zero or `deadline` passes.
    #[must_use]
    pub fn wait_zero_deadline(&self, deadline: Instant) -> bool {
        loop {
            let listener = self.event.listen();
            if self.get() == 0 {
                break;
            }
            if listener.wait_deadline(deadline).is_none() {
                return false;
            }
        }
        true
    }

    pub async fn wait_zero(&self) {
        loop {
            let listener = self.event.listen();
            if self.get() == 0 {
                break;
            }
            listener.await;
        }
    }
}

#[derive(Debug)]
struct DeferredState {
    queued: VecDeque<Dpc>,
    timers: [Option<Instant>; Timer::COUNT],
}

/// The DPC queue, the timer table and the outstanding-work counter.
pub(crate) struct DeferredWork {
    time: Box<dyn TimeSource>,
    state: Mutex<DeferredState>,
    outstanding: QuiescentCounter,
    wake: Event,
}

impl DeferredWork {
    pub fn new(time: Box<dyn TimeSource>) -> Self {
        Self {
            time,
            state: Mutex::new(DeferredState {
                queued: VecDeque::new(),
                timers: [None; Timer::COUNT],
            }),
            outstanding: QuiescentCounter::new("dpc_count"),
            wake: Event::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.time.now()
    }

    /// Queues `dpc`. Returns false, leaving the count unchanged, if it was
    /// already queued.
    pub fn insert_queue_dpc(&self, dpc: Dpc) -> bool {
        self.outstanding.increment();
        let mut state = self.state.lock();
        if state.queued.contains(&dpc) {
            drop(state);
            self.outstanding.decrement();
            return false;
        }
        state.queued.push_back(dpc);
        drop(state);
        tracing::trace!(?dpc, "dpc queued");
        self.wake.notify(1usize);
        true
    }

    /// Arms `timer` to fire after `due`. Returns true, leaving the count
    /// unchanged, if the timer was already armed; it is re-armed with the new
    /// deadline either way.
    pub fn set_timer(&self, timer: Timer, due: Duration) -> bool {
        self.outstanding.increment();
        let deadline = self.now() + due;
        let was_armed = self.state.lock().timers[timer.index()]
            .replace(deadline)
            .is_some();
        if was_armed {
            self.outstanding.decrement();
        }
        tracing::trace!(?timer, ?due, was_armed, "timer set");
        self.wake.notify(1usize);
        was_armed
    }

    /// Disarms `timer`. Returns true if it was armed, in which case its unit
    /// of outstanding work is released.
    pub fn cancel_timer(&self, timer: Timer) -> bool {
        let cancelled = self.state.lock().timers[timer.index()].take().is_some();
        if cancelled {
            self.dpc_epilogue();
        }
        cancelled
    }

    /// Releases the unit of outstanding work held by a routine that ran.
    pub fn dpc_epilogue(&self) {
        self.outstanding.decrement();
    }

    #[cfg(test)]
    pub fn is_armed(&self, timer: Timer) -> bool {
        self.state.lock().timers[timer.index()].is_some()
    }

    /// Takes the next routine that is ready to run: queued DPCs first, then
    /// the earliest expired timer.
    pub fn next_ready(&self) -> Option<Routine> {
        let now = self.now();
        let mut state = self.state.lock();
        if let Some(dpc) = state.queued.pop_front() {
            return Some(Routine::Dpc(dpc));
        }
        let timer = Timer::ALL
            .into_iter()
            .filter_map(|timer| {
                state.timers[timer.index()]
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, timer))
            })
            .min_by_key(|(deadline, _)| *deadline)
            .map(|(_, timer)| timer)?;
        state.timers[timer.index()] = None;
        Some(Routine::Timer(timer))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().timers.iter().flatten().min().copied()
    }

    pub fn outstanding(&self) -> &QuiescentCounter {
        &self.outstanding
    }
}

struct WorkerShared {
    device: SerialDevice,
    stop: AtomicBool,
}

/// A thread that runs a device's deferred work as it becomes ready.
pub struct DpcWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl DpcWorker {
    /// Starts a worker for `device`.
    pub fn spawn(device: SerialDevice) -> std::io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            device,
            stop: AtomicBool::new(false),
        });
        let thread = std::thread::Builder::new()
            .name(format!("{}-dpc", shared.device.name()))
            .spawn({
                let shared = shared.clone();
                move || shared.run()
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Stops the worker and waits for it to exit. Deferred work that is still
    /// outstanding stays queued.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared
            .device
            .inner
            .deferred
            .wake
            .notify(usize::MAX);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("dpc worker panicked");
            }
        }
    }
}

impl Drop for DpcWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkerShared {
    fn run(&self) {
        let deferred = &self.device.inner.deferred;
        loop {
            let listener = deferred.wake.listen();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.device.run_deferred() > 0 {
                continue;
            }
            match deferred.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(deferred.now());
                    let _ = listener.wait_timeout(timeout);
                }
                None => listener.wait(),
            }
        }
        tracing::debug!(port = %self.device.name(), "dpc worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work() -> (DeferredWork, MockTimeSource) {
        let time = MockTimeSource::new();
        (DeferredWork::new(Box::new(time.clone())), time)
    }

    #[test]
    fn redundant_dpc_does_not_count() {
        let (deferred, _time) = work();
        assert!(deferred.insert_queue_dpc(Dpc::CompleteRead));
        assert!(!deferred.insert_queue_dpc(Dpc::CompleteRead));
        assert_eq!(deferred.outstanding().get(), 1);
        assert_eq!(deferred.next_ready(), Some(Routine::Dpc(Dpc::CompleteRead)));
        deferred.dpc_epilogue();
        assert_eq!(deferred.outstanding().get(), 0);
        assert_eq!(deferred.next_ready(), None);
    }

    #[test]
    fn timer_rearm_and_cancel() {
        let (deferred, time) = work();
        assert!(!deferred.set_timer(Timer::ReadTotal, Duration::from_millis(10)));
        assert!(deferred.set_timer(Timer::ReadTotal, Duration::from_millis(20)));
        assert_eq!(deferred.outstanding().get(), 1);

        time.advance(Duration::from_millis(10));
        assert_eq!(deferred.next_ready(), None);
        assert!(deferred.cancel_timer(Timer::ReadTotal));
        assert!(!deferred.cancel_timer(Timer::ReadTotal));
        assert_eq!(deferred.outstanding().get(), 0);
    }

    #[test]
    fn expired_timers_fire_in_deadline_order() {
        let (deferred, time) = work();
        deferred.set_timer(Timer::WriteTotal, Duration::from_millis(30));
        deferred.set_timer(Timer::ReadInterval, Duration::from_millis(5));
        deferred.insert_queue_dpc(Dpc::CommWait);
        time.advance(Duration::from_millis(40));
        assert_eq!(deferred.next_ready(), Some(Routine::Dpc(Dpc::CommWait)));
        assert_eq!(
            deferred.next_ready(),
            Some(Routine::Timer(Timer::ReadInterval))
        );
        assert_eq!(deferred.next_ready(), Some(Routine::Timer(Timer::WriteTotal)));
        assert!(!deferred.is_armed(Timer::WriteTotal));
        // Fired routines still hold their units until their epilogue.
        assert_eq!(deferred.outstanding().get(), 3);
    }

    #[test]
    fn quiescence_wait() {
        let counter = Arc::new(QuiescentCounter::new("test"));
        assert!(counter.wait_zero_deadline(Instant::now()));
        counter.increment();
        assert!(!counter.wait_zero_deadline(Instant::now() + Duration::from_millis(1)));
        let thread = std::thread::spawn({
            let counter = counter.clone();
            move || counter.decrement()
        });
        futures::executor::block_on(counter.wait_zero());
        assert_eq!(thread.join().unwrap(), 0);
    }
}
