use crate::error::MediaError;
use crate::{AudioFrame, AudioHandle, FRAME_DURATION_MS, MediaAcquirer};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

const FRAME_QUEUE: usize = 32;
const MAX_ENCODED_FRAME: usize = 1275; // max Opus frame size per RFC 6716 3.2.1.
/// Input rates the Opus encoder accepts, preferred first.
const OPUS_RATES: [u32; 5] = [48_000, 24_000, 16_000, 12_000, 8_000];

/// Acquires the platform's default microphone.
#[derive(Debug, Default, Clone)]
pub struct MicAcquirer;

#[async_trait]
impl MediaAcquirer for MicAcquirer {
    type Handle = MicHandle;

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn acquire(&self) -> Result<MicHandle, MediaError> {
        let enabled = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let enabled_clone = enabled.clone();
        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                // The cpal stream is not Send; this thread owns it for the
                // whole capture lifetime and parks until release.
                match open_capture_stream(enabled_clone, frames_tx) {
                    Ok(stream) => {
                        let _ = result_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        tracing::debug!("Capture thread finished");
                    }
                    Err(err) => {
                        let _ = result_tx.send(Err(err));
                    }
                }
            })
            .map_err(|err| {
                MediaError::Other(anyhow!(err).context("Failed to spawn capture thread"))
            })?;

        match result_rx.await {
            Ok(Ok(())) => Ok(MicHandle {
                enabled,
                frames: Mutex::new(Some(frames_rx)),
                stop: Mutex::new(Some(stop_tx)),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(MediaError::Other(anyhow!(
                "capture thread exited before reporting"
            ))),
        }
    }
}

/// Handle to a running microphone capture.
pub struct MicHandle {
    enabled: Arc<AtomicBool>,
    frames: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    stop: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl AudioHandle for MicHandle {
    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.lock().take()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn release(&self) {
        if let Some(stop) = self.stop.lock().take() {
            tracing::debug!("Releasing microphone");
            drop(stop);
        }
    }
}

impl Drop for MicHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_capture_stream(
    enabled: Arc<AtomicBool>,
    frames_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::DeviceNotFound)?;
    tracing::debug!(name = ?device.name().ok(), "Opening default input device");

    let supported = pick_config(&device)?;
    let config: cpal::StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    tracing::debug!(?sample_rate, ?channels, "Selected input config");

    let mut encoder =
        FrameEncoder::new(sample_rate, channels, enabled, frames_tx).map_err(MediaError::Other)?;

    let stream = device
        .build_input_stream(
            &config,
            move |input: &[f32], _: &cpal::InputCallbackInfo| {
                encoder.push(input);
            },
            |err| {
                tracing::warn!(?err, "Capture stream error");
            },
            None,
        )
        .map_err(classify_build_error)?;

    stream.play().map_err(classify_play_error)?;
    tracing::info!("Microphone capture started");
    Ok(stream)
}

// TODO: resample instead of failing once a device without any
// Opus-compatible rate actually shows up in the field.
fn pick_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, MediaError> {
    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(classify_configs_error)?
        .filter(|range| range.sample_format() == SampleFormat::F32)
        .collect();

    for rate in OPUS_RATES {
        for range in &ranges {
            if range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0 {
                return Ok(range.clone().with_sample_rate(cpal::SampleRate(rate)));
            }
        }
    }

    Err(MediaError::Other(anyhow!(
        "no float input config at an Opus-compatible sample rate"
    )))
}

fn classify_build_error(err: cpal::BuildStreamError) -> MediaError {
    use cpal::BuildStreamError::*;
    match err {
        DeviceNotAvailable => MediaError::DeviceNotFound,
        BackendSpecific { err } => classify_backend(err.description),
        other => MediaError::Other(anyhow!(other)),
    }
}

fn classify_play_error(err: cpal::PlayStreamError) -> MediaError {
    use cpal::PlayStreamError::*;
    match err {
        DeviceNotAvailable => MediaError::DeviceNotFound,
        BackendSpecific { err } => classify_backend(err.description),
    }
}

fn classify_configs_error(err: cpal::SupportedStreamConfigsError) -> MediaError {
    use cpal::SupportedStreamConfigsError::*;
    match err {
        DeviceNotAvailable => MediaError::DeviceNotFound,
        BackendSpecific { err } => classify_backend(err.description),
        other => MediaError::Other(anyhow!(other)),
    }
}

/// Backends report permission problems as free-form text only.
fn classify_backend(description: String) -> MediaError {
    let lower = description.to_lowercase();
    if lower.contains("denied") || lower.contains("permission") || lower.contains("not allowed") {
        MediaError::PermissionDenied
    } else {
        MediaError::Other(anyhow!(description))
    }
}

/// Accumulates interleaved input into 20 ms mono frames and Opus-encodes
/// them. Lives inside the capture callback, so everything is preallocated.
struct FrameEncoder {
    frame: Vec<f32>,
    pos: usize,
    channels: usize,
    enabled: Arc<AtomicBool>,
    encoder: opus::Encoder,
    encoded: Vec<u8>,
    tx: mpsc::Sender<AudioFrame>,
}

impl FrameEncoder {
    fn new(
        sample_rate: u32,
        channels: usize,
        enabled: Arc<AtomicBool>,
        tx: mpsc::Sender<AudioFrame>,
    ) -> anyhow::Result<Self> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
                .context("Failed to create Opus encoder")?;
        encoder
            .set_inband_fec(true)
            .context("Failed to enable Opus inband FEC")?;

        let frame_size = (u64::from(sample_rate) * FRAME_DURATION_MS / 1000) as usize;
        Ok(Self {
            frame: vec![0.0; frame_size],
            pos: 0,
            channels: channels.max(1),
            enabled,
            encoder,
            encoded: vec![0u8; MAX_ENCODED_FRAME],
            tx,
        })
    }

    fn push(&mut self, input: &[f32]) {
        let enabled = self.enabled.load(Ordering::Relaxed);
        for samples in input.chunks(self.channels) {
            // Downmix interleaved input to mono; muted capture keeps the
            // stream running and substitutes silence.
            let sample = if enabled {
                samples.iter().sum::<f32>() / self.channels as f32
            } else {
                0.0
            };
            self.frame[self.pos] = sample;
            self.pos += 1;

            if self.pos == self.frame.len() {
                self.pos = 0;
                match self.encoder.encode_float(&self.frame, &mut self.encoded) {
                    Ok(len) => {
                        let bytes = Bytes::copy_from_slice(&self.encoded[..len]);
                        if let Err(err) = self.tx.try_send(bytes) {
                            tracing::trace!(?err, "Dropping encoded frame, consumer backlogged");
                        }
                    }
                    Err(err) => tracing::warn!(?err, "Failed to encode input frame"),
                }
            }
        }
    }
}
