//! Motor task: runs one timed forward command at a time.
//!
//! Each cycle waits for a duration on the motor channel, starts the drive,
//! arms the stop alarm, sleeps for the duration, then waits for the alarm's
//! completion signal before acknowledging with `"FIN"`. Commands are not
//! received while a cycle is in flight, so the channel queue serializes them.
//!
//! If the alarm has not fired `stop_grace_ms` after the requested duration the
//! task stops the drive itself and replies `"FLT"`.

use core::fmt;

use embassy_time::{with_timeout, Duration, Timer};

use super::{
    drive::{Actuator, Direction},
    timer::{CompletionTimer, TimerError},
    Component, Vehicle,
};
use crate::utils::connection::{ChannelError, CommandChannel, Opcode};

/// Phases of a command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    Idle,
    AwaitingCommand,
    Moving,
    Stopping,
    Acknowledging,
}

/// Why a command cycle did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorFault {
    /// The vehicle has no channel for the motor component.
    MissingChannel(Component),
    Channel(ChannelError),
    /// The drive rejected a direction or speed write.
    Drive,
    Timer(TimerError),
    /// The stop alarm did not fire within the grace period.
    TimerNotDelivered { duration_ms: u16 },
}

impl fmt::Display for MotorFault {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            MotorFault::MissingChannel(c) => write!(f, "no channel attached for {:?}", c),
            MotorFault::Channel(e) => write!(f, "channel anomaly: {}", e),
            MotorFault::Drive => write!(f, "drive write failed"),
            MotorFault::Timer(e) => write!(f, "{}", e),
            MotorFault::TimerNotDelivered { duration_ms } => {
                write!(f, "stop alarm for {} ms command never fired", duration_ms)
            }
        }
    }
}

/// The motor task of the car.
pub struct MotorController<'a, A> {
    vehicle: &'a Vehicle<'a>,
    channel: &'a CommandChannel,
    timer: &'a CompletionTimer<'a, A>,
    state: MotorState,
    completed: u32,
    faults: u32,
}

impl<'a, A: Actuator> MotorController<'a, A> {
    /// Bind the task to the vehicle's motor channel and the stop alarm.
    pub fn new(
        vehicle: &'a Vehicle<'a>,
        timer: &'a CompletionTimer<'a, A>,
    ) -> Result<Self, MotorFault> {
        let channel = vehicle
            .channel(Component::Motor)
            .ok_or(MotorFault::MissingChannel(Component::Motor))?;

        Ok(MotorController {
            vehicle,
            channel,
            timer,
            state: MotorState::Idle,
            completed: 0,
            faults: 0,
        })
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    /// Cycles that ended with `"FIN"`.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn faults(&self) -> u32 {
        self.faults
    }

    /// Serve commands forever, pausing `settle_ms` between cycles.
    pub async fn run(&mut self) -> ! {
        let settle = Duration::from_millis(self.vehicle.config().settle_ms.into());
        loop {
            match self.cycle().await {
                Ok(duration_ms) => {
                    tracing::info!(duration_ms, completed = self.completed, "command finished");
                }
                Err(MotorFault::Channel(e)) => {
                    tracing::warn!("skipping malformed command: {}", e);
                }
                Err(fault) => {
                    tracing::error!("command cycle faulted: {}", fault);
                }
            }

            if settle.as_ticks() > 0 {
                Timer::after(settle).await;
            }
        }
    }

    /// Run one full cycle: receive, move, stop, acknowledge.
    ///
    /// Returns the duration that was executed.
    pub async fn cycle(&mut self) -> Result<u16, MotorFault> {
        self.enter(MotorState::AwaitingCommand);
        let signal = self.timer.signal();
        if signal.is_raised() {
            tracing::warn!("completion signal still raised while idle, clearing");
            signal.reset();
        }

        let result = match self.channel.next_duration().await {
            Ok(duration_ms) => {
                tracing::info!(duration_ms, "Received duration command");
                self.execute(duration_ms).await
            }
            Err(e) => Err(MotorFault::Channel(e)),
        };

        if let Err(fault) = result {
            self.faults += 1;
            if !matches!(fault, MotorFault::Channel(_)) {
                self.acknowledge(Opcode::Fault);
            }
        }
        self.enter(MotorState::Idle);
        result
    }

    async fn execute(
        &mut self,
        duration_ms: u16,
    ) -> Result<u16, MotorFault> {
        let duration = Duration::from_millis(duration_ms.into());
        let signal = self.timer.signal();

        self.enter(MotorState::Moving);
        if let Err(fault) = self.start_forward() {
            self.halt();
            return Err(fault);
        }
        if let Err(e) = self.timer.arm(duration) {
            self.halt();
            return Err(MotorFault::Timer(e));
        }
        Timer::after(duration).await;

        self.enter(MotorState::Stopping);
        let grace = Duration::from_millis(self.vehicle.config().stop_grace_ms.into());
        if with_timeout(grace, signal.wait()).await.is_err() {
            self.timer.disarm();
            tracing::error!(duration_ms, "stop alarm overdue, forcing stop");
            self.halt();
            signal.reset();
            return Err(MotorFault::TimerNotDelivered { duration_ms });
        }
        if self.timer.take_stop_fault() {
            tracing::error!("stop alarm could not write the stop pattern");
            self.halt();
        }

        self.acknowledge(Opcode::Finished);
        signal.reset();
        self.completed += 1;
        Ok(duration_ms)
    }

    fn start_forward(&self) -> Result<(), MotorFault> {
        let duty_cycle = self.vehicle.duty_cycle();
        let ratio = self.vehicle.wheels_ratio();

        self.timer
            .drive()
            .lock(|drive| {
                let mut drive = drive.borrow_mut();
                drive.set_direction(Direction::Forward)?;
                drive.set_speed(duty_cycle, ratio)
            })
            .map(|levels| {
                tracing::debug!(a = levels.a, b = levels.b, "moving forward");
            })
            .map_err(|e| {
                tracing::error!("failed to start drive: {:?}", e);
                MotorFault::Drive
            })
    }

    fn halt(&self) {
        let result = self
            .timer
            .drive()
            .lock(|drive| drive.borrow_mut().set_direction(Direction::Stop));
        if let Err(e) = result {
            tracing::error!("failed to stop drive: {:?}", e);
        }
    }

    fn acknowledge(
        &mut self,
        opcode: Opcode,
    ) {
        self.enter(MotorState::Acknowledging);
        if let Err(e) = self.channel.reply(opcode) {
            tracing::warn!(?opcode, "acknowledgement dropped: {}", e);
        }
    }

    fn enter(
        &mut self,
        next: MotorState,
    ) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "motor state");
            self.state = next;
        }
    }
}
