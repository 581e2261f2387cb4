//! Module Exports
//!
//! This file exports the controllers of the differential-drive car and defines
//! the `Vehicle` that ties their configuration together.
//!
//! - `drive`: L298N differential drive (PWM speed, direction lines).
//! - `timer`: one-shot stop alarm and its completion signal.
//! - `motor`: the motor task that runs timed forward commands.

pub mod drive;
pub mod motor;
pub mod timer;

use core::fmt;

use heapless::LinearMap;
use serde::{Deserialize, Serialize};

use crate::utils::connection::CommandChannel;

pub use drive::{Actuator, DifferentialDrive, Direction, DriveError, PwmChannel, PwmSlice, SharedDrive};
pub use motor::{MotorController, MotorFault, MotorState};
pub use timer::{CompletionSignal, CompletionTimer, TimerError};

/// Components that can own a command channel.
const MAX_COMPONENTS: usize = 4;

/// Default bound on the wait for the stop alarm beyond the requested duration.
pub const DEFAULT_STOP_GRACE_MS: u32 = 250;
/// Default pause between two command cycles.
pub const DEFAULT_SETTLE_MS: u32 = 1000;

/// Logical parts of the car addressed through their own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Motor,
}

/// Start-up configuration of the car.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleConfig {
    /// Fraction of each PWM period the enable lines are high, in `[0, 1]`.
    pub duty_cycle: f32,
    /// Left/right power bias: `> 1` slows the left wheel, `< 1` the right.
    pub wheels_ratio: f32,
    /// How long past the requested duration the stop alarm may lag; must be non-zero.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u32,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u32,
}

fn default_stop_grace_ms() -> u32 {
    DEFAULT_STOP_GRACE_MS
}

fn default_settle_ms() -> u32 {
    DEFAULT_SETTLE_MS
}

impl VehicleConfig {
    pub fn new(
        duty_cycle: f32,
        wheels_ratio: f32,
    ) -> Self {
        VehicleConfig {
            duty_cycle,
            wheels_ratio,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }

    /// Reject values that would produce undefined PWM levels.
    pub fn validate(&self) -> Result<(), VehicleError> {
        if !(0.0..=1.0).contains(&self.duty_cycle) {
            return Err(VehicleError::DutyCycleOutOfRange);
        }
        if !(self.wheels_ratio.is_finite() && self.wheels_ratio > 0.0) {
            return Err(VehicleError::InvalidWheelsRatio);
        }
        if self.stop_grace_ms == 0 {
            return Err(VehicleError::ZeroStopGrace);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleError {
    DutyCycleOutOfRange,
    InvalidWheelsRatio,
    /// A zero grace would report every cycle as an overdue stop.
    ZeroStopGrace,
    /// No room left for another component channel.
    TooManyComponents,
}

impl fmt::Display for VehicleError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            VehicleError::DutyCycleOutOfRange => write!(f, "duty cycle must lie in [0, 1]"),
            VehicleError::InvalidWheelsRatio => write!(f, "wheels ratio must be positive and finite"),
            VehicleError::ZeroStopGrace => write!(f, "stop grace must be at least 1 ms"),
            VehicleError::TooManyComponents => {
                write!(f, "at most {} component channels", MAX_COMPONENTS)
            }
        }
    }
}

/// Validated configuration plus the channel of each component.
///
/// Built once at start-up and read-only afterwards.
pub struct Vehicle<'a> {
    config: VehicleConfig,
    components: LinearMap<Component, &'a CommandChannel, MAX_COMPONENTS>,
}

impl<'a> Vehicle<'a> {
    pub fn new(config: VehicleConfig) -> Result<Self, VehicleError> {
        config.validate().inspect_err(|e| {
            tracing::error!("rejecting vehicle configuration: {}", e);
        })?;
        Ok(Vehicle {
            config,
            components: LinearMap::new(),
        })
    }

    /// Route `component`'s commands through `channel`, replacing any earlier one.
    pub fn attach(
        &mut self,
        component: Component,
        channel: &'a CommandChannel,
    ) -> Result<(), VehicleError> {
        self.components
            .insert(component, channel)
            .map(|_| ())
            .map_err(|_| VehicleError::TooManyComponents)
    }

    pub fn with_component(
        mut self,
        component: Component,
        channel: &'a CommandChannel,
    ) -> Result<Self, VehicleError> {
        self.attach(component, channel)?;
        Ok(self)
    }

    pub fn channel(
        &self,
        component: Component,
    ) -> Option<&'a CommandChannel> {
        self.components.get(&component).copied()
    }

    pub fn config(&self) -> &VehicleConfig {
        &self.config
    }

    pub fn duty_cycle(&self) -> f32 {
        self.config.duty_cycle
    }

    pub fn wheels_ratio(&self) -> f32 {
        self.config.wheels_ratio
    }
}
