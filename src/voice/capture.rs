//! Audio capture from microphone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::detector::{DetectorState, ListenLimits, UtteranceDetector};
use crate::{Error, Result};

/// Preferred sample rate for capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// How often the capture thread drains the device buffer
const POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Slack on top of the start timeout for devices that deliver no samples
const STALL_SLACK: Duration = Duration::from_secs(1);

/// One captured utterance, ready for transcription
#[derive(Debug, Clone)]
pub struct UtteranceRequest {
    /// WAV-encoded mono audio
    pub audio: Vec<u8>,

    /// Sample rate of `audio`
    pub sample_rate: u32,

    /// When capture finished
    pub captured_at: DateTime<Utc>,

    /// Length of the utterance
    pub duration: Duration,

    /// Limits the capture ran with
    pub limits: ListenLimits,
}

impl UtteranceRequest {
    /// Encode captured samples
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn from_samples(samples: &[f32], sample_rate: u32, limits: ListenLimits) -> Result<Self> {
        #[allow(clippy::cast_precision_loss)]
        let duration = if sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(samples.len() as f64 / f64::from(sample_rate))
        };

        Ok(Self {
            audio: samples_to_wav(samples, sample_rate)?,
            sample_rate,
            captured_at: Utc::now(),
            duration,
            limits,
        })
    }
}

/// Result of one capture
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    /// An utterance was recorded
    Captured(UtteranceRequest),
    /// No speech started before the start timeout
    Timeout,
}

/// Records one bounded utterance
///
/// Always blocking from the caller's point of view; dropping the future
/// abandons the capture.
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    /// Calibrate for ambient noise, then record until silence, phrase limit or start timeout
    async fn listen(&self, limits: ListenLimits) -> Result<CaptureOutcome>;
}

/// Captures utterances from the default input device
pub struct MicrophoneCapture {
    calibration: Duration,
}

impl MicrophoneCapture {
    /// Create a microphone capture with the given calibration window
    #[must_use]
    pub const fn new(calibration: Duration) -> Self {
        Self { calibration }
    }
}

#[async_trait]
impl SpeechCapture for MicrophoneCapture {
    async fn listen(&self, limits: ListenLimits) -> Result<CaptureOutcome> {
        let calibration = self.calibration;
        let abort = Arc::new(AtomicBool::new(false));
        let _guard = AbortOnDrop(Arc::clone(&abort));

        tokio::task::spawn_blocking(move || record_utterance(calibration, limits, &abort))
            .await
            .map_err(|e| Error::Audio(format!("capture task failed: {e}")))?
    }
}

/// Signals the capture thread when the awaiting future goes away
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Blocking capture of one utterance
fn record_utterance(
    calibration: Duration,
    limits: ListenLimits,
    abort: &AtomicBool,
) -> Result<CaptureOutcome> {
    let mut capture = AudioCapture::new()?;
    capture.start()?;

    let sample_rate = capture.sample_rate();
    let mut detector = UtteranceDetector::new(sample_rate, limits);

    let calibration_end = Instant::now() + calibration;
    while Instant::now() < calibration_end {
        if abort.load(Ordering::SeqCst) {
            return Err(Error::Audio("capture aborted".to_string()));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    detector.calibrate(&capture.take_buffer());

    let listen_start = Instant::now();
    loop {
        if abort.load(Ordering::SeqCst) {
            capture.stop();
            return Err(Error::Audio("capture aborted".to_string()));
        }

        std::thread::sleep(POLL_INTERVAL);
        let chunk = capture.take_buffer();

        let state = if chunk.is_empty() {
            detector.state()
        } else {
            detector.process(&chunk)
        };

        match state {
            DetectorState::Waiting => {
                let stalled = limits
                    .start_timeout
                    .is_some_and(|t| listen_start.elapsed() > t + STALL_SLACK);
                if stalled {
                    tracing::warn!("input device delivered no audio before timeout");
                    capture.stop();
                    return Ok(CaptureOutcome::Timeout);
                }
            }
            DetectorState::InSpeech => {}
            DetectorState::TimedOut => {
                capture.stop();
                return Ok(CaptureOutcome::Timeout);
            }
            DetectorState::Complete => {
                capture.stop();
                let samples = detector.take_speech_buffer();
                let utterance = UtteranceRequest::from_samples(&samples, sample_rate, limits)?;
                tracing::debug!(
                    samples = samples.len(),
                    duration_ms = utterance.duration.as_millis(),
                    "utterance captured"
                );
                return Ok(CaptureOutcome::Captured(utterance));
            }
        }
    }
}

/// Raw sample capture from the default input device, downmixed to mono
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Create a new audio capture instance
    ///
    /// Prefers mono 16kHz and falls back to the device default.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let preferred = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)));

        let supported = match preferred {
            Some(config) => config,
            None => device
                .default_input_config()
                .map_err(|e| Error::Audio(e.to_string()))?,
        };

        let sample_format = supported.sample_format();
        let config = supported.config();

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_format,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let stream = match self.sample_format {
            SampleFormat::F32 => build_stream::<f32>(&self.device, &self.config, buffer)?,
            SampleFormat::I16 => build_stream::<i16>(&self.device, &self.config, buffer)?,
            SampleFormat::U16 => build_stream::<u16>(&self.device, &self.config, buffer)?,
            SampleFormat::I32 => build_stream::<i32>(&self.device, &self.config, buffer)?,
            other => {
                return Err(Error::Audio(format!("unsupported sample format: {other:?}")));
            }
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Get captured audio buffer and clear it
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Get captured audio buffer without clearing
    #[must_use]
    pub fn peek_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    /// Clear the audio buffer
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    for frame in data.chunks(channels) {
                        let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                        #[allow(clippy::cast_precision_loss)]
                        buf.push(sum / frame.len() as f32);
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
