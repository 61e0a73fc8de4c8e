//! Audio formats, chunks and PCM conversions
//!
//! Everything on the wire is 16-bit little-endian linear PCM. Capture devices
//! hand us f32 samples at whatever rate and channel count they like; these
//! helpers get them to the service format and back.

/// Sample rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Uplink format required by the service.
    pub const UPLINK: AudioFormat = AudioFormat::mono(16_000);
    /// Format of synthesized audio returned by the service.
    pub const DOWNLINK: AudioFormat = AudioFormat::mono(24_000);

    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// MIME type used in `realtimeInput.mediaChunks`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Parse `audio/pcm;rate=24000` style MIME types. Falls back to `default`
    /// when no rate parameter is present.
    pub fn from_mime(mime: &str, default: AudioFormat) -> AudioFormat {
        mime.split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse::<u32>().ok())
            .filter(|rate| *rate > 0)
            .map(AudioFormat::mono)
            .unwrap_or(default)
    }
}

/// Which way a chunk is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Captured locally, bound for the service
    Outbound,
    /// Synthesized by the service, bound for playback
    Inbound,
}

/// Raw PCM s16le audio with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub direction: Direction,
    pub format: AudioFormat,
    pub bytes: Vec<u8>,
}

impl AudioChunk {
    pub fn outbound(bytes: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            direction: Direction::Outbound,
            format,
            bytes,
        }
    }

    pub fn inbound(bytes: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            direction: Direction::Inbound,
            format,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Frames per channel contained in this chunk.
    pub fn frames(&self) -> usize {
        self.bytes.len() / 2 / usize::from(self.format.channels.max(1))
    }
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Duplicate mono samples across `channels` interleaved channels.
pub fn upmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .iter()
        .flat_map(|&s| std::iter::repeat(s).take(channels))
        .collect()
}

/// Linear-interpolation resampler for mono audio.
///
/// Output length is `floor(len * to / from)`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[idx + 1] - samples[idx]) * frac
        })
        .collect()
}

/// Convert normalized f32 samples to signed 16-bit, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32_768.0).collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode s16le bytes. A trailing odd byte is ignored.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Mean absolute amplitude, normalized to 0.0..=1.0.
pub fn average_amplitude(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|&s| u64::from(s.unsigned_abs())).sum();
    (sum as f64 / samples.len() as f64 / 32_768.0) as f32
}
