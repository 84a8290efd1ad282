//! Common audio types for Ensemble
//!
//! This module contains the fundamental audio types shared by the mixer,
//! the rooms, and the transport layer: the frame/packet representation of
//! one mix quantum and the fixed format constants that go with it.

use std::time::Duration;

/// Sample rate used throughout Ensemble (48kHz - matches the browser
/// AudioWorklet render quantum clients produce frames at)
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples per audio frame (one render quantum)
pub const SAMPLES_PER_FRAME: usize = 128;

/// Audio packet header: 4-byte sequence + 4-byte timestamp
pub const AUDIO_HEADER_SIZE: usize = 8;

/// Payload size: `SAMPLES_PER_FRAME` i16 samples
pub const AUDIO_PAYLOAD_SIZE: usize = SAMPLES_PER_FRAME * 2;

/// Total wire size of one audio datagram
pub const AUDIO_PACKET_SIZE: usize = AUDIO_HEADER_SIZE + AUDIO_PAYLOAD_SIZE;

/// Duration of one frame: 128 samples at 48kHz is ~2.667ms
pub const FRAME_PERIOD: Duration =
    Duration::from_micros(1_000_000 * SAMPLES_PER_FRAME as u64 / SAMPLE_RATE as u64);

/// One audio frame: a fixed-size buffer of [`SAMPLES_PER_FRAME`] i16 samples
/// plus the two wire headers.
///
/// This is both the element type flowing through the SPSC rings between
/// network and mixer threads and, via [`serialize`](AudioFrame::serialize) /
/// [`deserialize`](AudioFrame::deserialize), the 264-byte datagram format:
/// bytes 0-3 sequence (little-endian u32), bytes 4-7 timestamp (little-endian
/// u32), bytes 8-263 the samples packed contiguously.
///
/// `#[repr(C)]` plus the bytemuck derives give the sample block a stable
/// layout so serialization can cast it directly instead of copying sample
/// by sample.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AudioFrame {
    pub sequence: u32,
    pub timestamp: u32,
    pub samples: [i16; SAMPLES_PER_FRAME],
}

impl Default for AudioFrame {
    fn default() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

impl AudioFrame {
    /// Create a silent frame with zeroed headers
    pub fn silence() -> Self {
        Self::default()
    }

    /// Serialize to wire format.
    ///
    /// Headers are written little-endian; the sample block is written in
    /// native order, which is little-endian on every supported target.
    pub fn serialize(&self, buf: &mut [u8; AUDIO_PACKET_SIZE]) {
        buf[..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[AUDIO_HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(&self.samples));
    }

    /// Deserialize from wire format.
    ///
    /// A buffer shorter than [`AUDIO_PACKET_SIZE`] decodes to the zeroed
    /// frame; callers that care reject short datagrams before decoding.
    pub fn deserialize(data: &[u8]) -> Self {
        let mut frame = Self::default();
        if data.len() < AUDIO_PACKET_SIZE {
            return frame;
        }
        frame.sequence = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        frame.timestamp = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        // The source slice is not guaranteed to be 2-byte aligned, so read
        // per sample rather than casting.
        for (sample, bytes) in frame
            .samples
            .iter_mut()
            .zip(data[AUDIO_HEADER_SIZE..AUDIO_PACKET_SIZE].chunks_exact(2))
        {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        frame
    }
}
