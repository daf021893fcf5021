//! The voice interaction loop
//!
//! One worker task cycles wake listening, acknowledgement, command capture,
//! generation and speech. It owns the [`SessionState`] and reports every
//! transition as a [`SessionEvent`] on an ordered channel. Observers steer
//! it only through [`LoopSignal`]s.

use std::future::Future;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::{CaptureOutcome, SpeechCapture};
use super::detector::{ListenLimits, WakePhrase};
use super::speech::Speaker;
use super::stt::{TranscriptResult, Transcriber};
use crate::config::VoiceConfig;
use crate::generation::{GenerationResult, Generator};
use crate::session::{ButtonLabel, SessionEvent, SessionState, Stage, StatusState};
use crate::{Error, Result};

/// Spoken when no command follows the wake phrase
pub const NO_COMMAND_APOLOGY: &str = "I'm sorry, I didn't hear a command.";

/// Spoken when the transcription service fails
pub const SERVICE_APOLOGY: &str = "There seems to be an issue with the speech recognition service.";

/// Control input for a running loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// End the loop, cancelling any speech
    Stop,
    /// Cut off current speech and go back to wake listening
    Interrupt,
}

/// Remote clients that depend on the API key
pub struct Backends {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
}

/// Swappable backends, read once per cycle
#[derive(Clone, Default)]
pub struct BackendSlot(Arc<RwLock<Option<Arc<Backends>>>>);

impl BackendSlot {
    /// Slot holding `backends`
    #[must_use]
    pub fn new(backends: Option<Backends>) -> Self {
        Self(Arc::new(RwLock::new(backends.map(Arc::new))))
    }

    /// Install new backends; running loops pick them up on the next cycle
    pub fn replace(&self, backends: Backends) {
        if let Ok(mut slot) = self.0.write() {
            *slot = Some(Arc::new(backends));
        }
    }

    /// Current backends, if configured
    #[must_use]
    pub fn current(&self) -> Option<Arc<Backends>> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }
}

/// Everything the loop talks to
#[derive(Clone)]
pub struct VoiceServices {
    pub capture: Arc<dyn SpeechCapture>,
    pub speaker: Arc<dyn Speaker>,
    pub backends: BackendSlot,
}

/// Handle to a spawned loop
pub struct LoopHandle {
    signals: mpsc::UnboundedSender<LoopSignal>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Ask the loop to stop
    pub fn stop(&self) {
        let _ = self.signals.send(LoopSignal::Stop);
    }

    /// Ask the loop to cut off current speech
    pub fn interrupt(&self) {
        let _ = self.signals.send(LoopSignal::Interrupt);
    }

    /// Whether the worker has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "voice loop task failed");
        }
    }
}

/// How a cycle ended
enum Flow {
    Continue,
    Stop,
    GiveUp,
}

/// How a speech job ended
enum Spoken {
    Finished,
    Interrupted,
    Stopped,
}

/// The voice interaction worker
pub struct VoiceLoop {
    services: VoiceServices,
    config: VoiceConfig,
    wake: WakePhrase,
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,
    signals: mpsc::UnboundedReceiver<LoopSignal>,
    failures: u32,
}

impl VoiceLoop {
    /// Create a loop; nothing runs until [`Self::run`]
    #[must_use]
    pub fn new(
        services: VoiceServices,
        config: VoiceConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        signals: mpsc::UnboundedReceiver<LoopSignal>,
    ) -> Self {
        let wake = WakePhrase::new(&config.wake_phrase);
        Self {
            services,
            config,
            wake,
            state: SessionState::default(),
            events,
            signals,
            failures: 0,
        }
    }

    /// Spawn a loop on the runtime
    #[must_use]
    pub fn spawn(
        services: VoiceServices,
        config: VoiceConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> LoopHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let voice_loop = Self::new(services, config, events, rx);
        LoopHandle {
            signals: tx,
            task: tokio::spawn(voice_loop.run()),
        }
    }

    /// Run until stopped or a fatal error
    pub async fn run(mut self) {
        let events = self.state.start();
        self.publish_all(events);
        self.log("--- AI Activated ---");
        self.publish(SessionEvent::Button(ButtonLabel::Stop));
        self.status("Listening...", StatusState::Listening);

        let mut failed = false;
        loop {
            if self.stop_pending() {
                break;
            }

            let flow = match self.cycle().await {
                Ok(flow) => flow,
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "voice loop stopped");
                    self.log(&format!("Error: {e}"));
                    self.publish(SessionEvent::Fatal(e.to_string()));
                    failed = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "voice cycle failed");
                    self.log(&format!("An unexpected error occurred: {e}"));
                    if self.record_failure() {
                        Flow::GiveUp
                    } else if self.backoff().await {
                        Flow::Continue
                    } else {
                        Flow::Stop
                    }
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::GiveUp => {
                    tracing::error!(failures = self.failures, "voice loop giving up");
                    self.publish(SessionEvent::Fatal(format!(
                        "Stopped after {} consecutive errors. Check your connection and try again.",
                        self.failures
                    )));
                    failed = true;
                    break;
                }
            }
        }

        let events = self.state.stop();
        self.publish_all(events);
        self.log("--- AI Deactivated ---");
        self.publish(SessionEvent::Button(ButtonLabel::StartListening));
        if !failed {
            self.status("Ready", StatusState::Idle);
        }
    }

    async fn cycle(&mut self) -> Result<Flow> {
        let backends = self.services.backends.current().ok_or_else(|| {
            Error::ConfigurationMissing("set an API key before listening".to_string())
        })?;

        self.enter(Stage::AwaitingWake);
        let listening = format!("Listening for '{}'...", title_case(self.wake.as_str()));
        self.status(&listening, StatusState::Listening);

        let wake_limits =
            ListenLimits::phrase(self.config.wake_phrase_limit, self.config.pause_threshold);
        let Some(heard) = self.listen_and_transcribe(&backends, wake_limits).await? else {
            return Ok(Flow::Stop);
        };

        let text = match heard {
            TranscriptResult::Ok(text) => text,
            TranscriptResult::Empty => return Ok(Flow::Continue),
            failure => return self.transcription_failed(failure).await,
        };

        self.log(&format!("Heard: {text}"));
        if !self.wake.matches(&text) {
            return Ok(Flow::Continue);
        }

        self.enter(Stage::Acknowledging);
        self.status(
            "Wake word detected. Listening for your command...",
            StatusState::Processing,
        );
        let acknowledgement = self.config.acknowledgement.clone();
        match self.speak(&acknowledgement).await? {
            Spoken::Finished => {}
            Spoken::Interrupted => return Ok(Flow::Continue),
            Spoken::Stopped => return Ok(Flow::Stop),
        }

        self.enter(Stage::AwaitingCommand);
        self.status("Listening for command...", StatusState::Listening);

        let command_limits =
            ListenLimits::phrase(self.config.command_phrase_limit, self.config.pause_threshold)
                .with_start_timeout(self.config.command_start_timeout);
        let outcome = match guarded(
            &mut self.signals,
            self.services.capture.listen(command_limits),
        )
        .await
        {
            None => return Ok(Flow::Stop),
            Some(outcome) => outcome?,
        };

        let utterance = match outcome {
            CaptureOutcome::Captured(utterance) => utterance,
            CaptureOutcome::Timeout => {
                self.log("No command heard after wake word.");
                return Ok(match self.speak(NO_COMMAND_APOLOGY).await? {
                    Spoken::Stopped => Flow::Stop,
                    Spoken::Finished | Spoken::Interrupted => Flow::Continue,
                });
            }
        };

        let Some(heard) = guarded(
            &mut self.signals,
            backends.transcriber.transcribe(&utterance),
        )
        .await
        else {
            return Ok(Flow::Stop);
        };
        drop(utterance);

        let prompt = match heard {
            TranscriptResult::Ok(prompt) => {
                self.failures = 0;
                prompt
            }
            TranscriptResult::Empty => {
                tracing::debug!("command not understood");
                return Ok(Flow::Continue);
            }
            failure => return self.transcription_failed(failure).await,
        };
        self.log(&format!("User Prompt: {prompt}"));

        self.enter(Stage::Generating);
        self.status("Thinking...", StatusState::Thinking);

        let Some(generated) =
            guarded(&mut self.signals, backends.generator.generate(&prompt)).await
        else {
            return Ok(Flow::Stop);
        };

        let response = match generated {
            GenerationResult::Ok(text) => text,
            GenerationResult::Error(detail) => {
                self.log(&format!("Generation failed: {detail}"));
                if self.record_failure() {
                    return Ok(Flow::GiveUp);
                }
                return Ok(if self.backoff().await {
                    Flow::Continue
                } else {
                    Flow::Stop
                });
            }
        };

        self.log(&format!("AI Response: {response}"));
        Ok(match self.speak(&response).await? {
            Spoken::Stopped => Flow::Stop,
            Spoken::Finished | Spoken::Interrupted => Flow::Continue,
        })
    }

    /// Capture one utterance and transcribe it; `None` if stopped
    async fn listen_and_transcribe(
        &mut self,
        backends: &Backends,
        limits: ListenLimits,
    ) -> Result<Option<TranscriptResult>> {
        let outcome = match guarded(&mut self.signals, self.services.capture.listen(limits)).await
        {
            None => return Ok(None),
            Some(outcome) => outcome?,
        };

        let CaptureOutcome::Captured(utterance) = outcome else {
            return Ok(Some(TranscriptResult::Empty));
        };

        let result = guarded(
            &mut self.signals,
            backends.transcriber.transcribe(&utterance),
        )
        .await;

        match &result {
            Some(TranscriptResult::Ok(_)) => self.failures = 0,
            Some(TranscriptResult::Empty) => tracing::debug!("no speech recognised"),
            _ => {}
        }
        Ok(result)
    }

    async fn transcription_failed(&mut self, failure: TranscriptResult) -> Result<Flow> {
        let detail = match failure {
            TranscriptResult::ServiceError(detail) => detail,
            TranscriptResult::Timeout => "recognition request timed out".to_string(),
            TranscriptResult::Ok(_) | TranscriptResult::Empty => return Ok(Flow::Continue),
        };

        self.log(&format!("Could not request results; {detail}"));
        if self.record_failure() {
            return Ok(Flow::GiveUp);
        }

        if matches!(self.speak(SERVICE_APOLOGY).await?, Spoken::Stopped) {
            return Ok(Flow::Stop);
        }

        Ok(if self.backoff().await {
            Flow::Continue
        } else {
            Flow::Stop
        })
    }

    /// Speak `text`, returning when playback ends or is cut off
    async fn speak(&mut self, text: &str) -> Result<Spoken> {
        // Interrupts sent before this job started don't apply to it
        loop {
            match self.signals.try_recv() {
                Ok(LoopSignal::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Ok(Spoken::Stopped);
                }
                Ok(LoopSignal::Interrupt) => {}
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        let mut job = self.services.speaker.speak(text).await?;

        let events = self.state.begin_speaking();
        self.publish_all(events);
        self.status("Speaking...", StatusState::Speaking);
        self.publish(SessionEvent::Button(ButtonLabel::StopSpeaking));

        let (spoken, result) = tokio::select! {
            result = job.wait() => (Spoken::Finished, result),
            signal = self.signals.recv() => {
                let spoken = match signal {
                    Some(LoopSignal::Interrupt) => Spoken::Interrupted,
                    Some(LoopSignal::Stop) | None => Spoken::Stopped,
                };
                (spoken, job.cancel().await)
            }
        };
        drop(job);

        let events = self.state.finish_speaking();
        self.publish_all(events);
        if matches!(spoken, Spoken::Interrupted) {
            self.log("Speech interrupted by user");
        }
        if !matches!(spoken, Spoken::Stopped) {
            self.publish(SessionEvent::Button(ButtonLabel::Stop));
        }

        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(error = %e, "speech job ended with error");
        }
        Ok(spoken)
    }

    /// Sleep the retry backoff; false if stopped meanwhile
    async fn backoff(&mut self) -> bool {
        guarded(
            &mut self.signals,
            tokio::time::sleep(self.config.retry_backoff),
        )
        .await
        .is_some()
    }

    /// Count a recoverable failure; true once the budget is spent
    fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures_exhausted()
    }

    const fn failures_exhausted(&self) -> bool {
        let max = self.config.max_consecutive_failures;
        max > 0 && self.failures >= max
    }

    /// Drain pending signals; true if a stop was requested
    fn stop_pending(&mut self) -> bool {
        loop {
            match self.signals.try_recv() {
                Ok(LoopSignal::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    return true;
                }
                Ok(LoopSignal::Interrupt) => tracing::debug!("interrupt ignored, not speaking"),
                Err(mpsc::error::TryRecvError::Empty) => return false,
            }
        }
    }

    fn enter(&mut self, stage: Stage) {
        if let Some(event) = self.state.enter(stage) {
            tracing::debug!(?stage, "stage changed");
            self.publish(event);
        }
    }

    fn status(&self, message: &str, state: StatusState) {
        self.publish(SessionEvent::Status {
            message: message.to_string(),
            state,
        });
    }

    fn log(&self, message: &str) {
        tracing::info!("{message}");
        self.publish(SessionEvent::Log(message.to_string()));
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

/// Await `fut` unless a stop arrives first
///
/// Interrupts are not meaningful outside speech and are dropped here.
async fn guarded<F: Future>(
    signals: &mut mpsc::UnboundedReceiver<LoopSignal>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Some(output),
            signal = signals.recv() => match signal {
                Some(LoopSignal::Interrupt) => tracing::debug!("interrupt ignored, not speaking"),
                Some(LoopSignal::Stop) | None => return None,
            },
        }
    }
}

fn title_case(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}
