//! Utility re-exports and helper macros for the differential-drive car.
//!
//! This module re-exports the controllers, the command channel, timing, and the
//! PWM arithmetic:
//!
//! - `connection`: command channel between the command source and the motor task
//! - `controllers`: vehicle, L298N drive, stop alarm and the motor task
//! - `math`: PWM level computation
//!
//! The `mk_static!` macro simplifies static initialization in no-std contexts.

pub mod connection;
pub mod controllers;
pub mod math;

pub use connection::{CommandChannel, Opcode, MOTOR_CHANNEL};
pub use controllers::{MotorController, Vehicle, VehicleConfig};
pub use embassy_time::*;

#[doc(hidden)]
pub use static_cell;

#[macro_export]
/// Initialize a no-std static cell and write the given value into it.
///
/// This macro creates a `static_cell::StaticCell` for type `$t` and initializes
/// it with `$val`, returning a mutable reference to the stored value.
macro_rules! mk_static {
    ($t:ty, $val:expr) => {{
        static STATIC_CELL: $crate::utils::static_cell::StaticCell<$t> =
            $crate::utils::static_cell::StaticCell::new();
        STATIC_CELL.uninit().write($val)
    }};
}
