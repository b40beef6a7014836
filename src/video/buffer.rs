//! Front/back pixel buffers
//!
//! The assembler writes only through [`DoubleBuffer::write_handle`]; the
//! consumer reads only through [`DoubleBuffer::read_handle`]. `commit` swaps
//! the two roles without copying. Callers keep the whole structure behind a
//! single lock so a reader never sees a buffer that is still being written.
//!
//! A writer that renders outside the lock keeps its own frame and hands it
//! over with [`DoubleBuffer::publish`], which only exchanges `Vec`s.

use std::mem;

use crate::video::assembler::{AssembledFrame, FrameSink};
use crate::video::palette::{blit_packet, BYTES_PER_PIXEL};

pub struct DoubleBuffer {
    front: Vec<u8>,
    back: Vec<u8>,
    width: u32,
    height: u32,
    /// Front holds a real frame
    frame_ready: bool,
    /// A swap happened that the consumer has not picked up yet
    pending: bool,
    swaps: u64,
}

impl DoubleBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let size = Self::size_for(width, height);
        Self {
            front: vec![0; size],
            back: vec![0; size],
            width,
            height,
            frame_ready: false,
            pending: false,
            swaps: 0,
        }
    }

    fn size_for(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame_size(&self) -> usize {
        self.front.len()
    }

    /// Writer side: the buffer that will become visible on the next commit
    pub fn write_handle(&mut self) -> &mut [u8] {
        &mut self.back
    }

    /// Reader side: the last committed frame
    pub fn read_handle(&self) -> &[u8] {
        &self.front
    }

    /// Publish the back buffer
    pub fn commit(&mut self) {
        mem::swap(&mut self.front, &mut self.back);
        self.frame_ready = true;
        self.pending = true;
        self.swaps += 1;
    }

    /// Publish a frame rendered outside the lock.
    ///
    /// `frame` becomes the front buffer and receives a retired buffer for the
    /// writer to reuse, which may still have the previous dimensions.
    /// Returns true when the dimensions changed.
    pub fn publish(&mut self, frame: &mut Vec<u8>, width: u32, height: u32) -> bool {
        let resized = (width, height) != (self.width, self.height);
        self.width = width;
        self.height = height;

        mem::swap(&mut self.back, frame);
        self.commit();
        resized
    }

    pub fn is_frame_ready(&self) -> bool {
        self.frame_ready
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Mark the current front frame as consumed; returns whether it was new
    pub fn acknowledge(&mut self) -> bool {
        mem::replace(&mut self.pending, false)
    }

    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    /// Zero both buffers and forget any published frame
    pub fn clear(&mut self) {
        self.front.fill(0);
        self.back.fill(0);
        self.frame_ready = false;
        self.pending = false;
        self.swaps = 0;
    }

    /// Reallocate for new dimensions. Returns false when nothing changed.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if (width, height) == (self.width, self.height) {
            return false;
        }

        let size = Self::size_for(width, height);
        self.front = vec![0; size];
        self.back = vec![0; size];
        self.width = width;
        self.height = height;
        self.frame_ready = false;
        self.pending = false;
        true
    }
}

impl FrameSink for DoubleBuffer {
    fn frame_complete(&mut self, frame: &AssembledFrame<'_>) {
        let format = frame.format();
        self.resize(format.width, format.height);
        let size = Self::size_for(format.width, format.height);
        if self.back.len() != size {
            self.back.clear();
            self.back.resize(size, 0);
        }

        let height = self.height;
        let back = self.write_handle();
        for packet in frame.packets() {
            blit_packet(
                packet.payload,
                packet.line_number,
                packet.lines_per_packet,
                back,
                height,
            );
        }

        self.commit();
    }
}
