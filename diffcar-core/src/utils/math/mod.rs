//! Math utilities for the differential-drive car.
//!
//! This module provides the PWM level arithmetic used by the drive controller.

pub mod speed;
