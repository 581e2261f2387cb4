//! Core drive, stop-alarm and command plumbing for a two-motor differential-drive
//! car on an L298N H-bridge, for no-std embedded platforms.
//!
//! For a host-side run of the whole loop, see the `mock-mcu` binary.
#![no_std]

pub mod utils;
