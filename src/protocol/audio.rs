//! Audio stream packets
//!
//! A 2 byte little-endian sequence number followed by 192 interleaved
//! stereo frames of signed 16-bit PCM.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{AUDIO_FRAMES_PER_PACKET, AUDIO_HEADER_SIZE, AUDIO_PACKET_SIZE};
use crate::error::PacketError;

/// Samples per packet across both channels
pub const SAMPLES_PER_PACKET: usize = AUDIO_FRAMES_PER_PACKET * 2;

/// Decoded audio packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u16,
    /// Interleaved left/right samples
    pub samples: Vec<i16>,
}

impl AudioPacket {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() != AUDIO_PACKET_SIZE {
            return Err(PacketError::InvalidLength {
                expected: AUDIO_PACKET_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let sequence = buf.get_u16_le();
        let mut samples = Vec::with_capacity(SAMPLES_PER_PACKET);
        while buf.remaining() >= 2 {
            samples.push(buf.get_i16_le());
        }

        Ok(Self { sequence, samples })
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        if self.samples.len() > SAMPLES_PER_PACKET {
            return Err(PacketError::PayloadTooLarge(self.samples.len() * 2));
        }

        let mut buf = BytesMut::with_capacity(AUDIO_PACKET_SIZE);
        buf.put_u16_le(self.sequence);
        for sample in &self.samples {
            buf.put_i16_le(*sample);
        }
        buf.put_bytes(0, AUDIO_PACKET_SIZE - AUDIO_HEADER_SIZE - self.samples.len() * 2);

        Ok(buf.freeze())
    }

    /// Stereo frames carried by this packet
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}
