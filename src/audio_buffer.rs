//! Audio buffer module for reassembling device chunks into frames
//!
//! The capture callback delivers chunks of arbitrary length; the detector
//! wants fixed-size frames. `AudioBuffer` sits in between. It never
//! overwrites unread audio: samples that do not fit are rejected and counted.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Detector input rate
pub const SAMPLE_RATE: usize = 16000;

/// Samples per frame: 512 samples, ~32ms at 16kHz
pub const FRAME_SAMPLES: usize = 512;

/// Reassembly capacity: 1 second at 16kHz
pub const BUFFER_SIZE: usize = SAMPLE_RATE;

#[derive(Error, Debug)]
pub enum AudioBufferError {
    #[error("Buffer underflow: attempted to read {0} samples, but only {1} available")]
    Underflow(usize, usize),
}

/// One fixed-size block of mono 16kHz PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position in the device's production order. Gaps mean dropped frames.
    pub index: u64,

    pub samples: Vec<AudioSample>,
}

impl AudioFrame {
    pub fn new(index: u64, samples: Vec<AudioSample>) -> Self {
        Self { index, samples }
    }

    /// Raw s16le bytes, the layout the server expects for audio buffers
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Peak amplitude as a percentage of full scale
    pub fn peak_percent(&self) -> f32 {
        let peak = self
            .samples
            .iter()
            .map(|&s| (s as i32).unsigned_abs())
            .max()
            .unwrap_or(0);
        peak as f32 / i16::MAX as f32 * 100.0
    }

    /// Duration of the frame in milliseconds
    pub fn duration_ms(&self) -> f32 {
        self.samples.len() as f32 * 1000.0 / SAMPLE_RATE as f32
    }
}

/// Ring buffer that cuts a continuous sample stream into frames
pub struct AudioBuffer {
    ring: HeapRb<AudioSample>,
    frame_size: usize,
    rejected_samples: u64,
}

impl AudioBuffer {
    /// Create a new audio buffer with default capacity and frame size
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE, FRAME_SAMPLES)
    }

    /// Create a buffer with custom capacity
    pub fn with_capacity(capacity: usize, frame_size: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(frame_size)),
            frame_size,
            rejected_samples: 0,
        }
    }

    /// Append samples, returning how many were accepted
    ///
    /// Unread samples are never overwritten; whatever does not fit is
    /// rejected and added to `rejected_samples()`.
    pub fn write(&mut self, samples: &[AudioSample]) -> usize {
        let written = self.ring.push_slice(samples);

        if written < samples.len() {
            let rejected = samples.len() - written;
            self.rejected_samples += rejected as u64;
            warn!(
                rejected,
                total_rejected = self.rejected_samples,
                "Audio buffer full, rejecting new samples"
            );
        }

        written
    }

    /// Pop one full frame, if enough samples are buffered
    pub fn next_frame(&mut self) -> Option<Vec<AudioSample>> {
        if self.len() < self.frame_size {
            return None;
        }

        self.read(self.frame_size).ok()
    }

    /// Read and remove samples from the buffer
    pub fn read(&mut self, count: usize) -> Result<Vec<AudioSample>, AudioBufferError> {
        let available = self.ring.occupied_len();

        if count > available {
            return Err(AudioBufferError::Underflow(count, available));
        }

        let mut result = vec![0; count];
        let read = self.ring.pop_slice(&mut result);
        result.truncate(read);

        trace!("Read {} samples from buffer", read);
        Ok(result)
    }

    /// Get the number of samples currently in the buffer
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get buffer capacity
    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Get the amount of free space in the buffer
    pub fn free_space(&self) -> usize {
        self.ring.vacant_len()
    }

    /// Samples refused because the buffer was full
    pub fn rejected_samples(&self) -> u64 {
        self.rejected_samples
    }

    /// Clear all data from the buffer
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}
