//! One-shot stop alarm and the completion flag it raises.
//!
//! `CompletionTimer::expire` is the alarm callback. It may run in interrupt
//! context: it takes one critical section to put the drive in `Stop`, then
//! raises the `CompletionSignal`. It never blocks, allocates or logs.
//!
//! On targets with a hardware alarm, the interrupt handler calls `expire`
//! directly. Elsewhere `CompletionTimer::run` plays the alarm with
//! `embassy_time`.

use core::{
    cell::Cell,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use embassy_futures::select::{select, Either};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    signal::Signal,
};
use embassy_time::{Duration, Instant, Timer};

use super::drive::{Actuator, Direction, SharedDrive};

/// Flag set by the stop alarm once the motors are stopped.
///
/// Written once per cycle by the alarm, read and reset by the motor task.
pub struct CompletionSignal {
    raised: AtomicBool,
    notify: Signal<CriticalSectionRawMutex, ()>,
}

impl CompletionSignal {
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            notify: Signal::new(),
        }
    }

    /// Mark the stop as done and wake a waiting task.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.signal(());
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Clear the flag for the next cycle.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::Release);
        self.notify.reset();
    }

    /// Wait until the flag is raised.
    pub async fn wait(&self) {
        while !self.is_raised() {
            self.notify.wait().await;
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// An alarm is already pending; only one command may be in flight.
    AlreadyArmed,
}

impl fmt::Display for TimerError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            TimerError::AlreadyArmed => write!(f, "completion timer already armed"),
        }
    }
}

/// One-shot alarm that stops the drive and raises the completion signal.
pub struct CompletionTimer<'a, A> {
    drive: &'a SharedDrive<A>,
    signal: &'a CompletionSignal,
    armed: Mutex<CriticalSectionRawMutex, Cell<bool>>,
    stop_failed: AtomicBool,
    deadline: Signal<CriticalSectionRawMutex, Instant>,
    cancel: Signal<CriticalSectionRawMutex, ()>,
}

impl<'a, A: Actuator> CompletionTimer<'a, A> {
    pub const fn new(
        drive: &'a SharedDrive<A>,
        signal: &'a CompletionSignal,
    ) -> Self {
        Self {
            drive,
            signal,
            armed: Mutex::new(Cell::new(false)),
            stop_failed: AtomicBool::new(false),
            deadline: Signal::new(),
            cancel: Signal::new(),
        }
    }

    pub fn signal(&self) -> &'a CompletionSignal {
        self.signal
    }

    pub fn drive(&self) -> &'a SharedDrive<A> {
        self.drive
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock(Cell::get)
    }

    /// Schedule `expire` to run once, no earlier than `after` from now.
    pub fn arm(
        &self,
        after: Duration,
    ) -> Result<(), TimerError> {
        if self.armed.lock(|armed| armed.replace(true)) {
            return Err(TimerError::AlreadyArmed);
        }
        self.cancel.reset();
        self.deadline.signal(Instant::now() + after);
        Ok(())
    }

    /// Drop a pending alarm. Returns whether one was pending.
    pub fn disarm(&self) -> bool {
        let was_armed = self.armed.lock(|armed| armed.replace(false));
        self.deadline.reset();
        self.cancel.signal(());
        was_armed
    }

    /// Alarm callback: stop the drive, then raise the completion signal.
    pub fn expire(&self) {
        let stopped = self
            .drive
            .lock(|drive| drive.borrow_mut().set_direction(Direction::Stop).is_ok());
        if !stopped {
            self.stop_failed.store(true, Ordering::Release);
        }
        self.armed.lock(|armed| armed.set(false));
        self.signal.raise();
    }

    /// Whether the last `expire` failed to write the stop pattern; clears it.
    pub fn take_stop_fault(&self) -> bool {
        let failed = self.stop_failed.load(Ordering::Acquire);
        self.stop_failed.store(false, Ordering::Release);
        failed
    }

    /// Alarm loop for targets without a hardware alarm interrupt.
    pub async fn run(&self) -> ! {
        loop {
            let deadline = self.deadline.wait().await;
            match select(Timer::at(deadline), self.cancel.wait()).await {
                Either::First(()) => self.expire(),
                Either::Second(()) => {}
            }
        }
    }
}
