//! Utterance detection and wake phrase matching
//!
//! Energy-based endpointing: a short ambient sample sets the speech
//! threshold, then incoming audio is split into "waiting for onset",
//! "in speech" and "complete" by RMS energy against that threshold.

use std::time::Duration;

/// Lowest threshold allowed after calibration
const MIN_ENERGY_THRESHOLD: f32 = 0.01;

/// Threshold multiplier over measured ambient RMS
const AMBIENT_MULTIPLIER: f32 = 1.5;

/// Audio kept from before onset so the first syllable isn't clipped
const PRE_ROLL: Duration = Duration::from_millis(300);

/// Bounds for one capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenLimits {
    /// Longest utterance before capture is cut off
    pub max_phrase: Duration,

    /// Give up if speech hasn't started by then (`None` waits forever)
    pub start_timeout: Option<Duration>,

    /// Trailing silence that ends the utterance
    pub pause_threshold: Duration,
}

impl ListenLimits {
    /// Limits with no start timeout
    #[must_use]
    pub const fn phrase(max_phrase: Duration, pause_threshold: Duration) -> Self {
        Self {
            max_phrase,
            start_timeout: None,
            pause_threshold,
        }
    }

    /// Add a start timeout
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }
}

/// State of the utterance detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech onset
    Waiting,
    /// Speech started, accumulating
    InSpeech,
    /// Utterance ended by silence or phrase limit
    Complete,
    /// No onset before the start timeout
    TimedOut,
}

/// Splits a sample stream into one utterance
pub struct UtteranceDetector {
    threshold: f32,
    state: DetectorState,
    speech_buffer: Vec<f32>,
    pre_roll: Vec<f32>,
    waited: usize,
    silence_counter: usize,
    max_phrase_samples: usize,
    start_timeout_samples: Option<usize>,
    pause_samples: usize,
    pre_roll_samples: usize,
}

impl UtteranceDetector {
    /// Create a detector for the given sample rate and limits
    #[must_use]
    pub fn new(sample_rate: u32, limits: ListenLimits) -> Self {
        Self {
            threshold: MIN_ENERGY_THRESHOLD,
            state: DetectorState::Waiting,
            speech_buffer: Vec::new(),
            pre_roll: Vec::new(),
            waited: 0,
            silence_counter: 0,
            max_phrase_samples: samples_for(limits.max_phrase, sample_rate),
            start_timeout_samples: limits.start_timeout.map(|t| samples_for(t, sample_rate)),
            pause_samples: samples_for(limits.pause_threshold, sample_rate),
            pre_roll_samples: samples_for(PRE_ROLL, sample_rate),
        }
    }

    /// Adapt the speech threshold to room noise
    pub fn calibrate(&mut self, ambient: &[f32]) {
        let ambient_energy = calculate_energy(ambient);
        self.threshold = (ambient_energy * AMBIENT_MULTIPLIER).max(MIN_ENERGY_THRESHOLD);
        tracing::debug!(ambient_energy, threshold = self.threshold, "calibrated");
    }

    /// Feed samples; returns the state after processing
    pub fn process(&mut self, samples: &[f32]) -> DetectorState {
        let energy = calculate_energy(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Waiting => {
                if is_speech {
                    self.state = DetectorState::InSpeech;
                    self.speech_buffer = std::mem::take(&mut self.pre_roll);
                    self.speech_buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech onset");
                } else {
                    self.waited += samples.len();
                    self.pre_roll.extend_from_slice(samples);
                    if self.pre_roll.len() > self.pre_roll_samples {
                        let excess = self.pre_roll.len() - self.pre_roll_samples;
                        self.pre_roll.drain(..excess);
                    }
                    if self
                        .start_timeout_samples
                        .is_some_and(|limit| self.waited >= limit)
                    {
                        tracing::debug!(waited = self.waited, "no speech before timeout");
                        self.state = DetectorState::TimedOut;
                    }
                }
            }
            DetectorState::InSpeech => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter >= self.pause_samples {
                    tracing::debug!(samples = self.speech_buffer.len(), "utterance complete");
                    self.state = DetectorState::Complete;
                } else if self.speech_buffer.len() >= self.max_phrase_samples {
                    tracing::debug!(samples = self.speech_buffer.len(), "phrase limit reached");
                    self.speech_buffer.truncate(self.max_phrase_samples);
                    self.state = DetectorState::Complete;
                }
            }
            DetectorState::Complete | DetectorState::TimedOut => {}
        }

        self.state
    }

    /// Take the accumulated utterance
    pub fn take_speech_buffer(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.speech_buffer)
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Current speech threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// The trigger phrase that starts a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakePhrase(String);

impl WakePhrase {
    /// Create a wake phrase; matching is case-insensitive
    #[must_use]
    pub fn new(phrase: &str) -> Self {
        Self(phrase.trim().to_lowercase())
    }

    /// Check if a transcript contains the wake phrase
    #[must_use]
    pub fn matches(&self, transcript: &str) -> bool {
        !self.0.is_empty() && transcript.to_lowercase().contains(&self.0)
    }

    /// The normalized phrase
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)) as usize
}
