//! PWM arithmetic for the two L298N enable channels.
//!
//! The `PwmTiming` struct describes how the PWM slice divides the system clock,
//! and `channel_levels` maps a duty cycle plus a wheel ratio onto the two
//! channel compare levels.
//!
//! # Example
//! ```rust
//! use diffcar_core::utils::math::speed::{channel_levels, WRAP_VALUE};
//! let levels = channel_levels(0.5, 2.0, WRAP_VALUE);
//! assert!(levels.a < levels.b);
//! ```

/// System clock of the RP2040 (Hz).
pub const SYSTEM_CLOCK_HZ: u32 = 125_000_000;

/// Clock divider applied to the PWM slice (125 MHz / 200 = 625 kHz).
pub const CLOCK_DIVIDER: f32 = 200.0;

/// PWM counter period: 625 kHz / 31 250 = 20 Hz.
pub const WRAP_VALUE: u16 = 31_250;

/// Clock divider and counter period of a PWM slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmTiming {
    /// Fractional divider between the system clock and the PWM counter.
    pub clock_divider: f32,
    /// Counter top value; also the finest duty-cycle step.
    pub wrap: u16,
}

impl PwmTiming {
    /// Low-frequency timing suited to brushed DC motors behind an L298N.
    pub const fn motor() -> Self {
        Self {
            clock_divider: CLOCK_DIVIDER,
            wrap: WRAP_VALUE,
        }
    }

    /// Resulting PWM frequency for the given system clock.
    pub fn frequency_hz(
        &self,
        system_clock_hz: u32,
    ) -> f32 {
        system_clock_hz as f32 / self.clock_divider / self.wrap as f32
    }
}

impl Default for PwmTiming {
    fn default() -> Self {
        Self::motor()
    }
}

/// Which side receives the reduced power for a given wheel ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// `ratio > 1`: channel A (left) is scaled down by `1 / ratio`.
    Left,
    /// `ratio < 1`: channel B (right) is scaled down by `ratio`.
    Right,
    /// `ratio == 1`: both channels equal, used while calibrating.
    Balanced,
}

impl Bias {
    pub fn of(ratio: f32) -> Self {
        if ratio > 1.0 {
            Bias::Left
        } else if ratio < 1.0 {
            Bias::Right
        } else {
            Bias::Balanced
        }
    }
}

/// Compare levels for the two enable channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeedLevels {
    /// Channel A (ENA, left wheel).
    pub a: u16,
    /// Channel B (ENB, right wheel).
    pub b: u16,
}

/// Compute the channel levels for `duty_cycle` and `ratio` on a counter of `wrap`.
///
/// The duty cycle is clamped into `[0, 1]`. Levels are truncated toward zero,
/// so both always lie within `[0, wrap]`. `ratio` must be positive and finite;
/// anything else is treated as balanced.
///
/// Truncation means the biased channel is only strictly below the other once
/// the difference reaches one counter step: a duty cycle under `1 / wrap`
/// yields `0` on both channels.
pub fn channel_levels(
    duty_cycle: f32,
    ratio: f32,
    wrap: u16,
) -> SpeedLevels {
    let duty = if duty_cycle.is_nan() {
        0.0
    } else {
        duty_cycle.clamp(0.0, 1.0)
    };
    let full = wrap as f32 * duty;

    let (a, b) = match Bias::of(ratio) {
        Bias::Left if ratio.is_finite() => (full * (1.0 / ratio), full),
        Bias::Right if ratio > 0.0 => (full, full * ratio),
        _ => (full, full),
    };

    SpeedLevels {
        a: to_level(a, wrap),
        b: to_level(b, wrap),
    }
}

fn to_level(
    value: f32,
    wrap: u16,
) -> u16 {
    (value as u16).min(wrap)
}
