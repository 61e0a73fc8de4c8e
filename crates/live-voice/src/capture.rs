//! Audio capture pipeline
//!
//! The device callback only converts samples and hands them over a queue
//! ([`CaptureHandle`]). The session driver owns the single consumer side and
//! runs each frame through [`CapturePipeline`], which gates, chunks and feeds the
//! voice activity detector.

use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{
    average_amplitude, downmix, f32_to_pcm16, pcm16_to_bytes, resample, AudioChunk, AudioFormat,
};
use crate::config::{CaptureConfig, VadConfig, VadMode};
use crate::error::{LiveError, LiveResult};
use crate::vad::{VadEvent, VoiceActivityDetector};

/// Mono PCM at the uplink rate, stamped with its capture time.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub pcm: Vec<i16>,
    pub captured_at: Instant,
}

/// Cheap, clonable producer side of the capture queue.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<CapturedFrame>,
    target_rate: u32,
}

impl CaptureHandle {
    pub fn channel(target_rate: u32) -> (Self, mpsc::UnboundedReceiver<CapturedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, target_rate }, rx)
    }

    /// Convert device samples to uplink PCM and enqueue them.
    ///
    /// Returns false once the consumer is gone.
    pub fn push_f32(&self, samples: &[f32], sample_rate: u32, channels: u16) -> bool {
        let mono = downmix(samples, channels);
        let resampled = resample(&mono, sample_rate, self.target_rate);
        self.push_pcm16(f32_to_pcm16(&resampled))
    }

    /// Enqueue PCM that is already mono at the uplink rate.
    pub fn push_pcm16(&self, pcm: Vec<i16>) -> bool {
        if pcm.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(CapturedFrame {
                pcm,
                captured_at: Instant::now(),
            })
            .is_ok()
    }

    /// Enqueue a frame with an explicit capture time.
    pub fn push_frame(&self, frame: CapturedFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}

/// Collects bytes and releases them in exactly `chunk_bytes` slices.
pub struct ChunkAccumulator {
    chunk_bytes: usize,
    buffer: Vec<u8>,
}

impl ChunkAccumulator {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(2),
            buffer: Vec::with_capacity(chunk_bytes * 2),
        }
    }

    /// Append bytes and return every complete chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_bytes {
            let rest = self.buffer.split_off(self.chunk_bytes);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// Take whatever is left as a final, short chunk.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// What the driver should do with a processed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkAction {
    SendChunk(AudioChunk),
    StreamEnd,
    SpeechStarted,
    SpeechEnded,
}

impl From<VadEvent> for UplinkAction {
    fn from(event: VadEvent) -> Self {
        match event {
            VadEvent::SpeechStarted => UplinkAction::SpeechStarted,
            VadEvent::SpeechEnded => UplinkAction::SpeechEnded,
            VadEvent::StreamEnd => UplinkAction::StreamEnd,
        }
    }
}

/// Noise gate, chunking and turn detection for outbound audio.
pub struct CapturePipeline {
    noise_floor: f32,
    format: AudioFormat,
    accumulator: ChunkAccumulator,
    vad: VoiceActivityDetector,
}

impl CapturePipeline {
    pub fn new(capture: &CaptureConfig, vad: VadConfig) -> Self {
        Self {
            noise_floor: capture.noise_floor,
            format: AudioFormat::mono(capture.target_sample_rate),
            accumulator: ChunkAccumulator::new(capture.chunk_bytes()),
            vad: VoiceActivityDetector::new(vad),
        }
    }

    pub fn vad(&self) -> &VoiceActivityDetector {
        &self.vad
    }

    pub fn set_vad_mode(&mut self, mode: VadMode) {
        info!(?mode, "voice activity detection mode changed");
        self.vad.set_mode(mode);
    }

    /// Run one captured frame through the pipeline.
    ///
    /// An utterance boundary is a flush point: the short tail of the episode
    /// goes out ahead of its stream end.
    pub fn process(&mut self, frame: &CapturedFrame) -> Vec<UplinkAction> {
        let amplitude = average_amplitude(&frame.pcm);
        let mut actions: Vec<UplinkAction> = self
            .vad
            .observe(amplitude, frame.captured_at)
            .into_iter()
            .map(UplinkAction::from)
            .collect();

        if amplitude >= self.noise_floor {
            for bytes in self.accumulator.push(&pcm16_to_bytes(&frame.pcm)) {
                self.send_chunk(bytes, &mut actions);
            }
        }

        let pending = self.accumulator.pending() > 0;
        if let Some(event) = self.vad.poll_stream_end(frame.captured_at, pending) {
            if let Some(bytes) = self.accumulator.flush() {
                debug!(bytes = bytes.len(), "flushing utterance tail");
                self.send_chunk(bytes, &mut actions);
            }
            actions.push(event.into());
        }

        actions
    }

    /// Drain at termination: the short trailing chunk, then a stream end if
    /// the open episode still owes one.
    pub fn flush(&mut self) -> Vec<UplinkAction> {
        let mut actions = Vec::new();
        let owed = self
            .vad
            .take_final_stream_end(self.accumulator.pending() > 0);
        if let Some(bytes) = self.accumulator.flush() {
            debug!(bytes = bytes.len(), "flushing trailing capture chunk");
            self.send_chunk(bytes, &mut actions);
        }
        if owed {
            actions.push(UplinkAction::StreamEnd);
        }
        actions
    }

    /// Forget buffered audio and detector state (new connection).
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.vad.reset();
    }

    fn send_chunk(&mut self, bytes: Vec<u8>, actions: &mut Vec<UplinkAction>) {
        self.vad.note_chunk_sent();
        actions.push(UplinkAction::SendChunk(AudioChunk::outbound(
            bytes,
            self.format,
        )));
    }
}

/// Keeps a cpal input stream alive and feeding a [`CaptureHandle`].
///
/// Dropping the tap stops capture. cpal streams are not `Send`, so keep this on
/// the thread that created it.
pub struct MicrophoneTap {
    _stream: Stream,
    device_name: String,
}

impl MicrophoneTap {
    /// Open the default input device at its native format.
    pub fn start(handle: CaptureHandle) -> LiveResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| LiveError::AudioDevice("No input device available".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device.default_input_config()?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            return Err(LiveError::AudioDevice(format!(
                "unsupported input sample format {:?}",
                supported.sample_format()
            )));
        }
        let stream_config: cpal::StreamConfig = supported.into();
        let rate = stream_config.sample_rate.0;
        let channels = stream_config.channels;

        info!(
            device = %device_name,
            rate, channels, "🎤 Starting microphone capture"
        );

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                handle.push_f32(data, rate, channels);
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;

        Ok(Self {
            _stream: stream,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// List available input devices
    pub fn list_input_devices() -> LiveResult<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .input_devices()?
            .filter_map(|device| device.name().ok())
            .collect())
    }
}
