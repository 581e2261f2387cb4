//! Module Exports
//!
//! This file exports the command plumbing between the command source and the
//! motor task.
//!
//! # Modules
//! - `channel`: bounded frame queues, duration and opcode codecs.

/// Module for the command channel and its payload codecs.
pub mod channel;

pub use channel::{ChannelError, CommandChannel, Opcode, Wait, MOTOR_CHANNEL};
