//! VIC stream video packets
//!
//! Every datagram is exactly [`VIDEO_PACKET_SIZE`] bytes: a 12 byte
//! little-endian header followed by four raster lines of packed 4-bit pixels.
//!
//! ```text
//!  0       2       4        6       8     9     10      12
//!  ┌───────┬───────┬────────┬───────┬─────┬─────┬───────┬─────────────────┐
//!  │  seq  │ frame │L│ line │ px/ln │ lpp │ bpp │  enc  │ 4 x 192 bytes   │
//!  └───────┴───────┴────────┴───────┴─────┴─────┴───────┴─────────────────┘
//!                   L = last packet of the frame
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    BITS_PER_PIXEL, BYTES_PER_LINE, LINES_PER_PACKET, PIXELS_PER_LINE, VIDEO_HEADER_SIZE,
    VIDEO_PACKET_SIZE, VIDEO_PAYLOAD_SIZE,
};
use crate::error::PacketError;

/// High bit of the line field marks the final packet of a frame
pub const LAST_PACKET_FLAG: u16 = 0x8000;

/// Decoded video packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Datagram sequence number, wraps at 16 bits
    pub sequence: u16,
    /// Source frame this packet belongs to
    pub frame_number: u16,
    /// First raster line carried by this packet (15 bits)
    pub line_number: u16,
    /// Set on the last packet of a frame
    pub last_packet: bool,
    pub pixels_per_line: u16,
    pub lines_per_packet: u8,
    pub bits_per_pixel: u8,
    pub encoding: u16,
}

impl PacketHeader {
    /// Header with the fixed protocol geometry
    pub fn new(sequence: u16, frame_number: u16, line_number: u16, last_packet: bool) -> Self {
        Self {
            sequence,
            frame_number,
            line_number: line_number & !LAST_PACKET_FLAG,
            last_packet,
            pixels_per_line: PIXELS_PER_LINE,
            lines_per_packet: LINES_PER_PACKET,
            bits_per_pixel: BITS_PER_PIXEL,
            encoding: 0,
        }
    }

    fn parse(mut buf: &[u8]) -> Self {
        let sequence = buf.get_u16_le();
        let frame_number = buf.get_u16_le();
        let line_field = buf.get_u16_le();
        let pixels_per_line = buf.get_u16_le();
        let lines_per_packet = buf.get_u8();
        let bits_per_pixel = buf.get_u8();
        let encoding = buf.get_u16_le();

        Self {
            sequence,
            frame_number,
            line_number: line_field & !LAST_PACKET_FLAG,
            last_packet: line_field & LAST_PACKET_FLAG != 0,
            pixels_per_line,
            lines_per_packet,
            bits_per_pixel,
            encoding,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        let mut line_field = self.line_number & !LAST_PACKET_FLAG;
        if self.last_packet {
            line_field |= LAST_PACKET_FLAG;
        }

        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.frame_number);
        buf.put_u16_le(line_field);
        buf.put_u16_le(self.pixels_per_line);
        buf.put_u8(self.lines_per_packet);
        buf.put_u8(self.bits_per_pixel);
        buf.put_u16_le(self.encoding);
    }

    /// Reject geometry that does not match the fixed protocol constants
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.lines_per_packet != LINES_PER_PACKET
            || self.pixels_per_line != PIXELS_PER_LINE
            || self.bits_per_pixel != BITS_PER_PIXEL
        {
            return Err(PacketError::InvalidFormat {
                lines_per_packet: self.lines_per_packet,
                pixels_per_line: self.pixels_per_line,
                bits_per_pixel: self.bits_per_pixel,
            });
        }
        Ok(())
    }

    /// Position of this packet within its frame
    pub fn packet_index(&self) -> usize {
        (self.line_number / u16::from(self.lines_per_packet.max(1))) as usize
    }

    /// Frame height implied by this packet if it is the last one
    pub fn frame_height(&self) -> u32 {
        u32::from(self.line_number) + u32::from(self.lines_per_packet)
    }
}

/// A validated video packet borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy)]
pub struct VideoPacket<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> VideoPacket<'a> {
    /// Decode and validate one datagram
    pub fn decode(data: &'a [u8]) -> Result<Self, PacketError> {
        if data.len() != VIDEO_PACKET_SIZE {
            return Err(PacketError::InvalidLength {
                expected: VIDEO_PACKET_SIZE,
                actual: data.len(),
            });
        }

        let header = PacketHeader::parse(&data[..VIDEO_HEADER_SIZE]);
        header.validate()?;

        Ok(Self {
            header,
            payload: &data[VIDEO_HEADER_SIZE..],
        })
    }

    /// Packed bytes of one row within this packet
    pub fn line(&self, row: usize) -> Option<&'a [u8]> {
        let start = row * BYTES_PER_LINE;
        self.payload.get(start..start + BYTES_PER_LINE)
    }

    /// Serialize a packet; a short payload is zero padded
    pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Bytes, PacketError> {
        if payload.len() > VIDEO_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(VIDEO_PACKET_SIZE);
        header.write(&mut buf);
        buf.put_slice(payload);
        buf.put_bytes(0, VIDEO_PAYLOAD_SIZE - payload.len());

        Ok(buf.freeze())
    }
}
