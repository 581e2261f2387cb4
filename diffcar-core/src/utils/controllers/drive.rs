//! Differential drive over an L298N H-bridge.
//!
//! Two PWM channels set the power of the left (ENA) and right (ENB) motors,
//! and four digital lines (IN1..IN4) select the direction of each motor.

use core::{cell::RefCell, fmt};

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embedded_hal::digital::{OutputPin, PinState};

use crate::utils::math::speed::{channel_levels, Bias, PwmTiming, SpeedLevels};

/// Actuator shared between the motor task and the stop alarm.
///
/// Locking takes a critical section, so the alarm can use it from interrupt
/// context without blocking.
pub type SharedDrive<A> = Mutex<CriticalSectionRawMutex, RefCell<A>>;

/// Wrap an actuator so the motor task and the completion timer can share it.
pub fn share<A>(actuator: A) -> SharedDrive<A> {
    Mutex::new(RefCell::new(actuator))
}

/// One of the two outputs of a PWM slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmChannel {
    /// ENA, left wheel.
    A,
    /// ENB, right wheel.
    B,
}

/// PWM slice driving both enable inputs of the H-bridge.
///
/// Implemented by the board crate on top of its PWM peripheral.
pub trait PwmSlice {
    type Error: fmt::Debug;

    /// Route both enable lines to the PWM function.
    fn claim(&mut self) -> Result<(), Self::Error>;
    fn set_clock_divider(
        &mut self,
        divider: f32,
    ) -> Result<(), Self::Error>;
    fn set_wrap(
        &mut self,
        wrap: u16,
    ) -> Result<(), Self::Error>;
    fn set_channel_level(
        &mut self,
        channel: PwmChannel,
        level: u16,
    ) -> Result<(), Self::Error>;
    fn set_enabled(
        &mut self,
        enabled: bool,
    ) -> Result<(), Self::Error>;
}

/// Direction modes of the car.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Direction {
    pub const ALL: [Direction; 5] = [
        Direction::Forward,
        Direction::Backward,
        Direction::Left,
        Direction::Right,
        Direction::Stop,
    ];

    /// Levels of IN1..IN4 for this mode.
    pub const fn pattern(self) -> [bool; 4] {
        match self {
            Direction::Forward => [true, false, true, false],
            Direction::Backward => [false, true, false, true],
            Direction::Left => [false, true, true, false],
            Direction::Right => [true, false, false, true],
            Direction::Stop => [false, false, false, false],
        }
    }

    /// Mode whose pattern is `levels`, if any.
    pub fn from_pattern(levels: [bool; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.pattern() == levels)
    }
}

/// What the motor task and the stop alarm need from a drive.
pub trait Actuator {
    type Error: fmt::Debug;

    fn set_direction(
        &mut self,
        direction: Direction,
    ) -> Result<(), Self::Error>;

    /// Apply `duty_cycle` with the `ratio` bias and enable the PWM output.
    fn set_speed(
        &mut self,
        duty_cycle: f32,
        ratio: f32,
    ) -> Result<SpeedLevels, Self::Error>;
}

/// Errors raised by the differential drive.
#[derive(Debug)]
pub enum DriveError<SE: fmt::Debug, LE: fmt::Debug> {
    Pwm(SE),
    Line(LE),
    NotConfigured,
    InvalidRatio,
}

impl<SE: fmt::Debug, LE: fmt::Debug> fmt::Display for DriveError<SE, LE> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            DriveError::Pwm(e) => write!(f, "PWM slice error: {:?}", e),
            DriveError::Line(e) => write!(f, "direction line error: {:?}", e),
            DriveError::NotConfigured => write!(f, "drive used before configure()"),
            DriveError::InvalidRatio => write!(f, "wheel ratio must be positive and finite"),
        }
    }
}

/// L298N driver: one PWM slice for speed, four lines for direction.
pub struct DifferentialDrive<S, L> {
    slice: S,
    lines: [L; 4],
    timing: PwmTiming,
    configured: bool,
    direction: Option<Direction>,
    levels: SpeedLevels,
}

impl<S, L, SE, LE> DifferentialDrive<S, L>
where
    S: PwmSlice<Error = SE>,
    L: OutputPin<Error = LE>,
    SE: fmt::Debug,
    LE: fmt::Debug,
{
    /// Create a drive with the default 20 Hz motor timing.
    ///
    /// `lines` are IN1..IN4 in order. Nothing is written until `configure`.
    pub fn new(
        slice: S,
        lines: [L; 4],
    ) -> Self {
        Self::with_timing(slice, lines, PwmTiming::motor())
    }

    pub fn with_timing(
        slice: S,
        lines: [L; 4],
        timing: PwmTiming,
    ) -> Self {
        DifferentialDrive {
            slice,
            lines,
            timing,
            configured: false,
            direction: None,
            levels: SpeedLevels::default(),
        }
    }

    /// Claim the PWM slice, program its timing and park the lines in `Stop`.
    ///
    /// Calling it again after a success does nothing.
    pub fn configure(&mut self) -> Result<(), DriveError<SE, LE>> {
        if self.configured {
            return Ok(());
        }

        self.slice.claim().map_err(DriveError::Pwm)?;
        self.slice
            .set_clock_divider(self.timing.clock_divider)
            .map_err(DriveError::Pwm)?;
        self.slice
            .set_wrap(self.timing.wrap)
            .map_err(DriveError::Pwm)?;
        tracing::info!(
            divider = self.timing.clock_divider,
            wrap = self.timing.wrap,
            "PWM slice claimed"
        );

        self.write_pattern(Direction::Stop)?;
        self.configured = true;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Last direction fully written to the lines.
    ///
    /// `None` before `configure` or after a failed write.
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Levels last written to the two channels.
    pub fn levels(&self) -> SpeedLevels {
        self.levels
    }

    pub fn timing(&self) -> PwmTiming {
        self.timing
    }

    pub fn forward(&mut self) -> Result<(), DriveError<SE, LE>> {
        self.set_direction(Direction::Forward)
    }

    pub fn backward(&mut self) -> Result<(), DriveError<SE, LE>> {
        self.set_direction(Direction::Backward)
    }

    pub fn left(&mut self) -> Result<(), DriveError<SE, LE>> {
        self.set_direction(Direction::Left)
    }

    pub fn right(&mut self) -> Result<(), DriveError<SE, LE>> {
        self.set_direction(Direction::Right)
    }

    pub fn stop(&mut self) -> Result<(), DriveError<SE, LE>> {
        self.set_direction(Direction::Stop)
    }

    fn write_pattern(
        &mut self,
        direction: Direction,
    ) -> Result<(), DriveError<SE, LE>> {
        self.direction = None;
        for (line, level) in self.lines.iter_mut().zip(direction.pattern()) {
            line.set_state(PinState::from(level))
                .map_err(DriveError::Line)?;
        }
        self.direction = Some(direction);
        Ok(())
    }
}

impl<S, L, SE, LE> Actuator for DifferentialDrive<S, L>
where
    S: PwmSlice<Error = SE>,
    L: OutputPin<Error = LE>,
    SE: fmt::Debug,
    LE: fmt::Debug,
{
    type Error = DriveError<SE, LE>;

    fn set_direction(
        &mut self,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        if !self.configured {
            return Err(DriveError::NotConfigured);
        }
        self.write_pattern(direction)
    }

    fn set_speed(
        &mut self,
        duty_cycle: f32,
        ratio: f32,
    ) -> Result<SpeedLevels, Self::Error> {
        if !self.configured {
            return Err(DriveError::NotConfigured);
        }
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(DriveError::InvalidRatio);
        }
        if !(0.0..=1.0).contains(&duty_cycle) {
            tracing::warn!(duty_cycle, "duty cycle clamped into [0, 1]");
        }

        let levels = channel_levels(duty_cycle, ratio, self.timing.wrap);
        if Bias::of(ratio) == Bias::Balanced {
            tracing::info!("Calibrating: balanced wheel ratio");
        }

        self.slice
            .set_channel_level(PwmChannel::A, levels.a)
            .map_err(DriveError::Pwm)?;
        self.slice
            .set_channel_level(PwmChannel::B, levels.b)
            .map_err(DriveError::Pwm)?;
        self.slice.set_enabled(true).map_err(DriveError::Pwm)?;

        self.levels = levels;
        tracing::debug!(a = levels.a, b = levels.b, "channel levels applied");
        Ok(levels)
    }
}
