//! Fixed-capacity circular sample buffer that cuts chunk-sized windows for
//! the streaming pipeline.
//!
//! The buffer holds the most recent `capacity` samples; older audio is
//! overwritten. Reads are addressed by absolute sample offset from session
//! start, so a window that has been overwritten is detected and rejected
//! rather than returning silently corrupted audio.

use chrono::Utc;

use crate::error::BufferError;
use crate::protocol::AudioChunk;

#[derive(Debug, Clone)]
pub struct ChunkBufferConfig {
    pub sample_rate: u32,
    /// Total capacity, in seconds of audio.
    pub capacity_s: f32,
    pub chunk_duration_s: f32,
    pub chunk_overlap_s: f32,
}

impl Default for ChunkBufferConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::defaults::SAMPLE_RATE,
            capacity_s: crate::defaults::BUFFER_CAPACITY_S,
            chunk_duration_s: crate::defaults::CHUNK_DURATION_S,
            chunk_overlap_s: crate::defaults::CHUNK_OVERLAP_S,
        }
    }
}

/// One step of chunk emission.
#[derive(Debug)]
pub enum PoppedChunk {
    /// A full chunk, ready for transcription.
    Ready(AudioChunk),
    /// A chunk whose window was overwritten before it could be cut. The
    /// index is still consumed; the caller must account for it (the
    /// transcript marks it as a gap) so the index range stays contiguous.
    Overwritten { index: u64 },
}

pub struct ChunkBuffer {
    ring: Vec<f32>,
    capacity: u64,
    sample_rate: u32,
    chunk_samples: u64,
    overlap_samples: u64,
    /// Total samples ever written; the next write lands at this offset.
    written: u64,
    /// Absolute offset where the next chunk's non-overlap region begins.
    next_boundary: u64,
    next_index: u64,
}

impl ChunkBuffer {
    pub fn new(config: ChunkBufferConfig) -> Self {
        let capacity = ((config.capacity_s * config.sample_rate as f32) as u64).max(1);
        let chunk_samples =
            ((config.chunk_duration_s * config.sample_rate as f32) as u64).max(1);
        let overlap_samples = (config.chunk_overlap_s * config.sample_rate as f32) as u64;
        Self {
            ring: vec![0.0; capacity as usize],
            capacity,
            sample_rate: config.sample_rate,
            chunk_samples,
            overlap_samples,
            written: 0,
            next_boundary: 0,
            next_index: 0,
        }
    }

    /// Total samples written since session start.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Absolute offset of the oldest sample still resident.
    pub fn oldest(&self) -> u64 {
        self.written.saturating_sub(self.capacity)
    }

    /// Append samples, overwriting the oldest audio once full.
    pub fn write(&mut self, samples: &[f32]) {
        for &sample in samples {
            let slot = (self.written % self.capacity) as usize;
            self.ring[slot] = sample;
            self.written += 1;
        }
    }

    /// Copy `len` samples starting at absolute offset `start`.
    pub fn read_window(&self, start: u64, len: u64) -> Result<Vec<f32>, BufferError> {
        let end = start + len;
        if end > self.written {
            return Err(BufferError::Underrun {
                requested_end: end,
                written: self.written,
            });
        }
        let oldest = self.oldest();
        if start < oldest {
            return Err(BufferError::Stale {
                start,
                oldest,
            });
        }
        let mut out = Vec::with_capacity(len as usize);
        for offset in start..end {
            out.push(self.ring[(offset % self.capacity) as usize]);
        }
        Ok(out)
    }

    /// Cut the next full chunk if enough audio has accumulated.
    ///
    /// Each chunk spans its boundary plus the configured overlap reaching
    /// back into the previous chunk. A boundary whose window was already
    /// overwritten yields `Overwritten` rather than corrupt audio; capture
    /// outran transcription and the index must be marked as a gap.
    pub fn pop_ready_chunk(&mut self) -> Result<Option<PoppedChunk>, BufferError> {
        let end = self.next_boundary + self.chunk_samples;
        if end > self.written {
            return Ok(None);
        }
        let window_start = self.next_boundary.saturating_sub(self.overlap_samples);
        if window_start < self.oldest() {
            let index = self.next_index;
            self.next_boundary = end;
            self.next_index += 1;
            tracing::warn!(chunk = index, "chunk window overwritten");
            return Ok(Some(PoppedChunk::Overwritten { index }));
        }
        let samples = self.read_window(window_start, end - window_start)?;
        let chunk = AudioChunk {
            index: self.next_index,
            start_sample: window_start,
            end_sample: end,
            samples,
            sample_rate: self.sample_rate,
            captured_at: Utc::now(),
        };
        self.next_boundary = end;
        self.next_index += 1;
        Ok(Some(PoppedChunk::Ready(chunk)))
    }

    /// Cut the final partial chunk after capture stops. Returns `None` when
    /// no samples remain past the last boundary.
    pub fn flush(&mut self) -> Result<Option<AudioChunk>, BufferError> {
        if self.next_boundary >= self.written {
            return Ok(None);
        }
        let window_start = self
            .next_boundary
            .saturating_sub(self.overlap_samples)
            .max(self.oldest());
        let samples = self.read_window(window_start, self.written - window_start)?;
        let chunk = AudioChunk {
            index: self.next_index,
            start_sample: window_start,
            end_sample: self.written,
            samples,
            sample_rate: self.sample_rate,
            captured_at: Utc::now(),
        };
        self.next_boundary = self.written;
        self.next_index += 1;
        Ok(Some(chunk))
    }
}
