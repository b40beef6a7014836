//! VIC-II palette and 4-bit to BGRA expansion

use crate::constants::{BYTES_PER_LINE, PIXELS_PER_LINE};

/// Bytes per output pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Output bytes for one expanded raster line
pub const OUTPUT_LINE_SIZE: usize = PIXELS_PER_LINE as usize * BYTES_PER_PIXEL;

/// VIC-II colors as 0xAARRGGBB, stored little-endian so memory order is BGRA
pub const VIC_PALETTE: [u32; 16] = [
    0xFF000000, // black
    0xFFEFEFEF, // white
    0xFF342F8D, // red
    0xFFCDD46A, // cyan
    0xFFA43598, // purple
    0xFF42B44C, // green
    0xFFB1292C, // blue
    0xFF5DEFEF, // yellow
    0xFF204E98, // orange
    0xFF00385B, // brown
    0xFF6D67D1, // light red
    0xFF4A4A4A, // dark grey
    0xFF7B7B7B, // mid grey
    0xFF93EF9F, // light green
    0xFFEF6A6D, // light blue
    0xFFB2B2B2, // light grey
];

/// BGRA bytes of a palette entry
#[inline]
pub fn bgra(index: u8) -> [u8; 4] {
    VIC_PALETTE[usize::from(index & 0x0F)].to_le_bytes()
}

/// Expand one packed line into BGRA pixels.
///
/// The low nibble of each byte is the left pixel, the high nibble the right.
/// Converts as many pixel pairs as both slices allow.
pub fn expand_line(src: &[u8], dst: &mut [u8]) {
    for (pair, out) in src.iter().zip(dst.chunks_exact_mut(BYTES_PER_PIXEL * 2)) {
        out[..4].copy_from_slice(&bgra(pair & 0x0F));
        out[4..].copy_from_slice(&bgra(pair >> 4));
    }
}

/// Expand a packet's rows into a full frame at the packet's line offset.
///
/// Rows that would land past `height` are skipped.
pub fn blit_packet(payload: &[u8], line_number: u16, lines_per_packet: u8, frame: &mut [u8], height: u32) {
    for row in 0..usize::from(lines_per_packet) {
        let y = usize::from(line_number) + row;
        if y >= height as usize {
            break;
        }

        let src_start = row * BYTES_PER_LINE;
        let Some(src) = payload.get(src_start..src_start + BYTES_PER_LINE) else {
            break;
        };
        let dst_start = y * OUTPUT_LINE_SIZE;
        let Some(dst) = frame.get_mut(dst_start..dst_start + OUTPUT_LINE_SIZE) else {
            break;
        };

        expand_line(src, dst);
    }
}
