//! Audio playback pipeline
//!
//! Inbound base64 PCM is decoded, converted and scheduled on an [`AudioSink`]
//! from a dedicated task, so the receive loop never blocks on audio work.
//! Interruption bumps a generation counter: anything queued before it is
//! dropped, and the sink is stopped right away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{bytes_to_pcm16, pcm16_to_f32, resample, upmix, AudioChunk, AudioFormat};
use crate::error::{LiveError, LiveResult};

/// Where decoded audio ends up.
pub trait AudioSink: Send + Sync {
    /// Rate and channel count samples must be converted to.
    fn output_format(&self) -> AudioFormat;

    /// Queue interleaved f32 samples right after whatever is already queued.
    fn schedule(&self, samples: Vec<f32>) -> LiveResult<()>;

    /// Stop immediately and drop anything queued.
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Discards audio. For headless sessions.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn output_format(&self) -> AudioFormat {
        AudioFormat::DOWNLINK
    }

    fn schedule(&self, _samples: Vec<f32>) -> LiveResult<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn is_playing(&self) -> bool {
        false
    }
}

/// Plays through rodio on the default output device.
///
/// `OutputStream` is not `Send`, so it lives on its own thread for as long as
/// this sink exists.
pub struct RodioSink {
    handle: OutputStreamHandle,
    sink: Mutex<Arc<Sink>>,
    format: AudioFormat,
    _keepalive: std_mpsc::Sender<()>,
}

impl RodioSink {
    pub fn new() -> LiveResult<Self> {
        info!("🔊 Initializing audio playback");

        let format = default_output_format();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("live-voice-output".into())
            .spawn(move || {
                let stream = match OutputStream::try_default() {
                    Ok((stream, handle)) => {
                        let _ = ready_tx.send(Ok(handle));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                // parked until the sink is dropped
                let _ = keepalive_rx.recv();
                drop(stream);
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|e| LiveError::Playback(e.to_string()))?
            .map_err(LiveError::Playback)?;
        let sink = Sink::try_new(&handle).map_err(|e| LiveError::Playback(e.to_string()))?;

        info!(
            rate = format.sample_rate,
            channels = format.channels,
            "✅ Audio playback initialized"
        );

        Ok(Self {
            handle,
            sink: Mutex::new(Arc::new(sink)),
            format,
            _keepalive: keepalive_tx,
        })
    }

    fn current(&self) -> Arc<Sink> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AudioSink for RodioSink {
    fn output_format(&self) -> AudioFormat {
        self.format
    }

    fn schedule(&self, samples: Vec<f32>) -> LiveResult<()> {
        let source = SamplesBuffer::new(self.format.channels, self.format.sample_rate, samples);
        self.current().append(source);
        Ok(())
    }

    fn stop(&self) {
        let mut slot = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.stop();
        // a stopped sink is replaced so later audio starts without waiting
        match Sink::try_new(&self.handle) {
            Ok(fresh) => *slot = Arc::new(fresh),
            Err(e) => warn!("could not recreate output sink: {}", e),
        }
        info!("⏹️ Audio playback stopped");
    }

    fn is_playing(&self) -> bool {
        !self.current().empty()
    }
}

fn default_output_format() -> AudioFormat {
    cpal::default_host()
        .default_output_device()
        .and_then(|device| device.default_output_config().ok())
        .map(|cfg| AudioFormat {
            sample_rate: cfg.sample_rate().0,
            channels: cfg.channels(),
        })
        .unwrap_or(AudioFormat {
            sample_rate: 48_000,
            channels: 2,
        })
}

enum PlaybackCommand {
    Audio {
        generation: u64,
        mime_type: String,
        data: String,
    },
    Settle(oneshot::Sender<()>),
}

/// Producer side of the playback pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
    generation: Arc<AtomicU64>,
    sink: Arc<dyn AudioSink>,
}

impl PlaybackHandle {
    /// Queue a base64 PCM payload. Never blocks.
    pub fn enqueue(&self, mime_type: impl Into<String>, data: impl Into<String>) {
        let command = PlaybackCommand::Audio {
            generation: self.generation.load(Ordering::SeqCst),
            mime_type: mime_type.into(),
            data: data.into(),
        };
        if self.tx.send(command).is_err() {
            debug!("playback task gone, dropping payload");
        }
    }

    /// Stop playback now and discard everything queued.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.sink.is_playing()
    }

    /// Wait until everything enqueued before this call has been processed.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PlaybackCommand::Settle(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Owns the decoding task.
pub struct PlaybackPipeline {
    handle: PlaybackHandle,
    task: JoinHandle<()>,
}

impl PlaybackPipeline {
    /// Start the decoding task. `default_format` applies to payloads whose
    /// MIME type has no rate.
    pub fn spawn(sink: Arc<dyn AudioSink>, default_format: AudioFormat) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let worker = PlaybackWorker {
            sink: sink.clone(),
            generation: generation.clone(),
            default_format,
            carry: None,
            carry_generation: 0,
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            handle: PlaybackHandle {
                tx,
                generation,
                sink,
            },
            task,
        }
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    /// Stop audio and end the task. Handles cloned earlier become inert.
    pub async fn shutdown(self) {
        self.handle.interrupt();
        self.task.abort();
        let _ = self.task.await;
        debug!("playback pipeline shut down");
    }
}

struct PlaybackWorker {
    sink: Arc<dyn AudioSink>,
    generation: Arc<AtomicU64>,
    default_format: AudioFormat,
    /// Odd trailing byte of the previous payload.
    carry: Option<u8>,
    carry_generation: u64,
}

impl PlaybackWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PlaybackCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PlaybackCommand::Audio {
                    generation,
                    mime_type,
                    data,
                } => {
                    if generation != self.generation.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = self.play(generation, &mime_type, &data) {
                        warn!("dropping inbound audio: {}", e);
                    }
                }
                PlaybackCommand::Settle(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("playback task finished");
    }

    fn play(&mut self, generation: u64, mime_type: &str, data: &str) -> LiveResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut bytes = STANDARD
            .decode(data)
            .map_err(|e| LiveError::Playback(format!("invalid base64 audio: {}", e)))?;

        if self.carry_generation != generation {
            self.carry = None;
            self.carry_generation = generation;
        }
        if let Some(byte) = self.carry.take() {
            bytes.insert(0, byte);
        }
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let format = AudioFormat::from_mime(mime_type, self.default_format);
        let chunk = AudioChunk::inbound(bytes, format);
        debug!(
            frames = chunk.frames(),
            rate = chunk.format.sample_rate,
            "scheduling inbound audio"
        );
        let output = self.sink.output_format();
        let mono = pcm16_to_f32(&bytes_to_pcm16(&chunk.bytes));
        let resampled = resample(&mono, chunk.format.sample_rate, output.sample_rate);
        let samples = upmix(&resampled, output.channels);
        if samples.is_empty() {
            return Ok(());
        }
        self.sink.schedule(samples)
    }
}
