//! Voice processing module
//!
//! Microphone capture, utterance detection, transcription, OS speech
//! output, and the interaction loop that ties them together.

mod capture;
mod detector;
pub mod interaction;
mod speech;
mod stt;

pub use capture::{
    AudioCapture, CaptureOutcome, MicrophoneCapture, SAMPLE_RATE, SpeechCapture,
    UtteranceRequest, samples_to_wav,
};
pub use detector::{
    DetectorState, ListenLimits, UtteranceDetector, WakePhrase, calculate_energy,
};
pub use interaction::{BackendSlot, Backends, LoopHandle, LoopSignal, VoiceLoop, VoiceServices};
pub use speech::{
    SpeechCommand, SpeechDispatcher, SpeechHandle, SpeechJob, Speaker, sweep_orphans,
};
pub use stt::{GeminiTranscriber, TranscriptResult, Transcriber, WhisperTranscriber};
