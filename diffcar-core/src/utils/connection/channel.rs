//! Command channel between the command issuer and the motor task.
//!
//! Payloads travel as small byte frames through bounded queues. Sends never
//! wait: a full queue drops the frame and reports `ChannelError::Full`.
//! Receives wait for a frame, optionally bounded by a timeout.
//!
//! Two lanes make up a `CommandChannel`:
//! - inbound: little-endian `u16` durations in milliseconds
//! - outbound: 3-byte acknowledgement opcodes (`"FIN"`, `"FLT"`)

use core::fmt;

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::{with_timeout, Duration};
use heapless::Vec;

/// Largest payload a single frame can carry.
pub const MAX_FRAME: usize = 8;
/// Frames each lane can hold before sends start failing.
pub const QUEUE_DEPTH: usize = 4;
/// Size of an inbound duration payload.
pub const DURATION_LEN: usize = 2;
/// Size of an outbound opcode payload.
pub const OPCODE_LEN: usize = 3;

/// One queued payload.
pub type Frame = Vec<u8, MAX_FRAME>;

/// Channel used by the command source to reach the motor task.
pub static MOTOR_CHANNEL: CommandChannel = CommandChannel::new();

/// Anomalies reported by the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The lane is at capacity; the frame was dropped.
    Full,
    /// Payload larger than `MAX_FRAME`.
    Oversized { len: usize },
    /// A frame arrived with an unexpected length (0 on timeout).
    SizeMismatch { expected: usize, received: usize },
    /// The outbound token is not a known opcode.
    UnknownOpcode([u8; OPCODE_LEN]),
}

impl fmt::Display for ChannelError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ChannelError::Full => write!(f, "channel full, frame dropped"),
            ChannelError::Oversized { len } => {
                write!(f, "payload of {} bytes exceeds frame size {}", len, MAX_FRAME)
            }
            ChannelError::SizeMismatch { expected, received } => {
                write!(f, "expected {} bytes, received {}", expected, received)
            }
            ChannelError::UnknownOpcode(token) => write!(f, "unknown opcode {:?}", token),
        }
    }
}

/// How long a receive may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Forever,
    For(Duration),
}

/// Acknowledgements sent back by the motor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// The previous command's motion has fully stopped.
    Finished,
    /// The stop alarm never fired; the motors were stopped by the fallback.
    Fault,
}

impl Opcode {
    pub const fn token(self) -> &'static [u8; OPCODE_LEN] {
        match self {
            Opcode::Finished => b"FIN",
            Opcode::Fault => b"FLT",
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ChannelError> {
        let token: [u8; OPCODE_LEN] =
            bytes
                .try_into()
                .map_err(|_| ChannelError::SizeMismatch {
                    expected: OPCODE_LEN,
                    received: bytes.len(),
                })?;
        match &token {
            b"FIN" => Ok(Opcode::Finished),
            b"FLT" => Ok(Opcode::Fault),
            _ => Err(ChannelError::UnknownOpcode(token)),
        }
    }
}

/// Encode a duration request as it travels on the inbound lane.
pub const fn encode_duration(duration_ms: u16) -> [u8; DURATION_LEN] {
    duration_ms.to_le_bytes()
}

/// Decode an inbound payload into milliseconds.
pub fn decode_duration(bytes: &[u8]) -> Result<u16, ChannelError> {
    let raw: [u8; DURATION_LEN] =
        bytes
            .try_into()
            .map_err(|_| ChannelError::SizeMismatch {
                expected: DURATION_LEN,
                received: bytes.len(),
            })?;
    Ok(u16::from_le_bytes(raw))
}

/// Bounded queue of byte frames.
pub struct MessageBuffer<const N: usize> {
    frames: Channel<CriticalSectionRawMutex, Frame, N>,
}

impl<const N: usize> MessageBuffer<N> {
    pub const fn new() -> Self {
        Self {
            frames: Channel::new(),
        }
    }

    /// Queue `payload` without waiting.
    pub fn send(
        &self,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let frame = Frame::from_slice(payload).map_err(|_| ChannelError::Oversized {
            len: payload.len(),
        })?;
        self.frames.try_send(frame).map_err(|_| ChannelError::Full)
    }

    /// Wait for the next frame and copy it into `buf`.
    ///
    /// Returns the number of bytes received, or 0 when the wait timed out or
    /// the frame did not fit in `buf` (the frame is discarded in that case).
    pub async fn receive(
        &self,
        buf: &mut [u8],
        max_wait: Wait,
    ) -> usize {
        let frame = match max_wait {
            Wait::Forever => self.frames.receive().await,
            Wait::For(timeout) => match with_timeout(timeout, self.frames.receive()).await {
                Ok(frame) => frame,
                Err(_) => return 0,
            },
        };

        if frame.len() > buf.len() {
            tracing::warn!(
                "discarding {} byte frame, receive buffer holds {}",
                frame.len(),
                buf.len()
            );
            return 0;
        }
        buf[..frame.len()].copy_from_slice(&frame);
        frame.len()
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&self) {
        self.frames.clear();
    }
}

impl<const N: usize> Default for MessageBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Both lanes between one command issuer and one motor task.
pub struct CommandChannel {
    inbound: MessageBuffer<QUEUE_DEPTH>,
    outbound: MessageBuffer<QUEUE_DEPTH>,
}

impl CommandChannel {
    pub const fn new() -> Self {
        Self {
            inbound: MessageBuffer::new(),
            outbound: MessageBuffer::new(),
        }
    }

    /// Issuer side: request a forward run of `duration_ms`.
    pub fn request(
        &self,
        duration_ms: u16,
    ) -> Result<(), ChannelError> {
        self.inbound.send(&encode_duration(duration_ms))
    }

    /// Issuer side: wait for the next acknowledgement.
    pub async fn next_reply(
        &self,
        max_wait: Wait,
    ) -> Result<Opcode, ChannelError> {
        let mut buf = [0u8; MAX_FRAME];
        let n = self.outbound.receive(&mut buf, max_wait).await;
        Opcode::parse(&buf[..n])
    }

    /// Task side: wait, without bound, for the next duration request.
    pub async fn next_duration(&self) -> Result<u16, ChannelError> {
        let mut buf = [0u8; MAX_FRAME];
        let n = self.inbound.receive(&mut buf, Wait::Forever).await;
        decode_duration(&buf[..n])
    }

    /// Task side: send an acknowledgement without waiting.
    pub fn reply(
        &self,
        opcode: Opcode,
    ) -> Result<(), ChannelError> {
        self.outbound.send(opcode.token())
    }

    /// Raw inbound lane, for sources that write their own frames.
    pub fn inbound(&self) -> &MessageBuffer<QUEUE_DEPTH> {
        &self.inbound
    }

    /// Raw outbound lane.
    pub fn outbound(&self) -> &MessageBuffer<QUEUE_DEPTH> {
        &self.outbound
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}
