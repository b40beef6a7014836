//! Stream start/stop commands for the device's TCP command interface
//!
//! Start: `[0x20 + id, 0xFF, len, 0x00, duration lo, duration hi, "ip:port"]`
//! where `len` counts the duration word plus the destination string.
//! Stop: `[0x30 + id, 0xFF, 0x00, 0x00]`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

const START_OPCODE: u8 = 0x20;
const STOP_OPCODE: u8 = 0x30;
const COMMAND_PREFIX: u8 = 0xFF;

/// Streams the device can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamId {
    Video = 0,
    Audio = 1,
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamId::Video => write!(f, "video"),
            StreamId::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stream forever to `destination` ("ip:port")
    Start { stream: StreamId, destination: String },
    Stop { stream: StreamId },
}

impl ControlCommand {
    pub fn stream(&self) -> StreamId {
        match self {
            ControlCommand::Start { stream, .. } | ControlCommand::Stop { stream } => *stream,
        }
    }

    pub fn encode(&self) -> Result<Bytes, NetworkError> {
        match self {
            ControlCommand::Start {
                stream,
                destination,
            } => {
                let param_len = 2 + destination.len();
                let param_len =
                    u8::try_from(param_len).map_err(|_| NetworkError::DestinationTooLong(destination.len()))?;

                let mut buf = BytesMut::with_capacity(6 + destination.len());
                buf.put_u8(START_OPCODE + *stream as u8);
                buf.put_u8(COMMAND_PREFIX);
                buf.put_u8(param_len);
                buf.put_u8(0x00);
                // Duration 0 = until stopped
                buf.put_u16_le(0);
                buf.put_slice(destination.as_bytes());
                Ok(buf.freeze())
            }
            ControlCommand::Stop { stream } => Ok(Bytes::copy_from_slice(&[
                STOP_OPCODE + *stream as u8,
                COMMAND_PREFIX,
                0x00,
                0x00,
            ])),
        }
    }
}
