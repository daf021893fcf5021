//! Daemon - the presentation-side controller
//!
//! Owns the configuration store and the voice loop handle. Surfaces
//! (websocket bridge, console) talk to it through a [`DaemonHandle`]:
//! commands go in over an mpsc channel, loop events come out over a
//! broadcast channel and a snapshot watch.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{Config, ConfigStore, SttProvider};
use crate::generation::GeminiGenerator;
use crate::session::{SessionEvent, SessionSnapshot, StatusState};
use crate::voice::{
    BackendSlot, Backends, GeminiTranscriber, LoopHandle, MicrophoneCapture, SpeechCapture,
    SpeechDispatcher, Speaker, VoiceLoop, VoiceServices, WhisperTranscriber, sweep_orphans,
};
use crate::{Error, Result};

/// Command queue depth; control commands are never dropped
const COMMAND_CAPACITY: usize = 32;

/// Event fan-out depth; slow surfaces may miss log lines
const EVENT_CAPACITY: usize = 256;

/// Reply to an API key submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResponse {
    pub success: bool,
    pub message: String,
}

/// Configuration state shown to surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigView {
    pub require_setup: bool,
    pub has_key: bool,
}

/// Commands a surface can send
#[derive(Debug)]
pub enum SurfaceCommand {
    /// Interrupt speech, else stop, else start
    ToggleListening,
    /// Cut off current speech
    InterruptSpeech,
    /// Persist a new API key
    SubmitApiKey {
        api_key: String,
        reply: oneshot::Sender<KeyResponse>,
    },
    /// Read configuration state
    GetConfig { reply: oneshot::Sender<ConfigView> },
    /// Stop the loop and exit
    Shutdown,
}

/// Builds the services the voice loop needs
pub trait ServiceFactory: Send + Sync {
    /// Speech capture
    ///
    /// # Errors
    ///
    /// Returns error if capture cannot be set up
    fn capture(&self, config: &Config) -> Result<Arc<dyn SpeechCapture>>;

    /// Speech output
    ///
    /// # Errors
    ///
    /// Returns `SpeechDispatch` if the speak command is unusable
    fn speaker(&self, config: &Config) -> Result<Arc<dyn Speaker>>;

    /// Transcription and generation clients
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationMissing` without a usable key
    fn backends(&self, config: &Config) -> Result<Backends>;
}

/// Microphone, OS speak command and Gemini
pub struct SystemServices;

impl ServiceFactory for SystemServices {
    fn capture(&self, config: &Config) -> Result<Arc<dyn SpeechCapture>> {
        Ok(Arc::new(MicrophoneCapture::new(config.voice.calibration)))
    }

    fn speaker(&self, config: &Config) -> Result<Arc<dyn Speaker>> {
        Ok(Arc::new(SpeechDispatcher::new(
            config.voice.speak_command.clone(),
            config.voice.interrupt_grace,
        )?))
    }

    fn backends(&self, config: &Config) -> Result<Backends> {
        use secrecy::ExposeSecret;

        let api_key = config
            .api_key
            .as_ref()
            .ok_or_else(|| Error::ConfigurationMissing("Gemini API key not set".to_string()))?;
        let generation = &config.generation;

        let generator = GeminiGenerator::new(
            api_key.expose_secret(),
            &generation.model,
            &generation.base_url,
            generation.timeout,
        )?;

        let transcription = &config.transcription;
        let transcriber: Arc<dyn crate::voice::Transcriber> = match transcription.provider {
            SttProvider::Gemini => Arc::new(GeminiTranscriber::new(
                api_key.expose_secret(),
                &transcription.model,
                &generation.base_url,
                transcription.timeout,
            )?),
            SttProvider::Whisper => {
                let openai_key = transcription.openai_api_key.as_ref().ok_or_else(|| {
                    Error::ConfigurationMissing("OPENAI_API_KEY required for Whisper".to_string())
                })?;
                Arc::new(WhisperTranscriber::new(
                    openai_key.expose_secret(),
                    transcription.model.clone(),
                    transcription.timeout,
                )?)
            }
        };

        Ok(Backends {
            transcriber,
            generator: Arc::new(generator),
        })
    }
}

/// Cloneable access to a running daemon
#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::Sender<SurfaceCommand>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl DaemonHandle {
    async fn send(&self, command: SurfaceCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Config("daemon is not running".to_string()))
    }

    /// Smart toggle: interrupt speech, else stop, else start
    ///
    /// # Errors
    ///
    /// Returns error if the daemon has exited
    pub async fn toggle(&self) -> Result<()> {
        self.send(SurfaceCommand::ToggleListening).await
    }

    /// Interrupt current speech
    ///
    /// # Errors
    ///
    /// Returns error if the daemon has exited
    pub async fn interrupt(&self) -> Result<()> {
        self.send(SurfaceCommand::InterruptSpeech).await
    }

    /// Save a new API key
    ///
    /// # Errors
    ///
    /// Returns error if the daemon has exited
    pub async fn submit_api_key(&self, api_key: String) -> Result<KeyResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(SurfaceCommand::SubmitApiKey { api_key, reply }).await?;
        rx.await
            .map_err(|_| Error::Config("daemon dropped the request".to_string()))
    }

    /// Current configuration state
    ///
    /// # Errors
    ///
    /// Returns error if the daemon has exited
    pub async fn config(&self) -> Result<ConfigView> {
        let (reply, rx) = oneshot::channel();
        self.send(SurfaceCommand::GetConfig { reply }).await?;
        rx.await
            .map_err(|_| Error::Config("daemon dropped the request".to_string()))
    }

    /// Ask the daemon to exit
    ///
    /// # Errors
    ///
    /// Returns error if the daemon has already exited
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SurfaceCommand::Shutdown).await
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

}

/// The controller task
pub struct Daemon {
    config: Config,
    store: ConfigStore,
    factory: Arc<dyn ServiceFactory>,
    backends: BackendSlot,
    voice_loop: Option<LoopHandle>,
    commands_tx: mpsc::Sender<SurfaceCommand>,
    commands: mpsc::Receiver<SurfaceCommand>,
    loop_events_tx: mpsc::UnboundedSender<SessionEvent>,
    loop_events: mpsc::UnboundedReceiver<SessionEvent>,
    broadcast: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl Daemon {
    /// Create a daemon backed by the real microphone, speaker and Gemini
    #[must_use]
    pub fn new(config: Config, store: ConfigStore) -> Self {
        Self::with_factory(config, store, Arc::new(SystemServices))
    }

    /// Create a daemon with custom services
    #[must_use]
    pub fn with_factory(
        config: Config,
        store: ConfigStore,
        factory: Arc<dyn ServiceFactory>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (loop_events_tx, loop_events) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        Self {
            config,
            store,
            factory,
            backends: BackendSlot::default(),
            voice_loop: None,
            commands_tx,
            commands,
            loop_events_tx,
            loop_events,
            broadcast,
            snapshot,
        }
    }

    /// Handle for surfaces
    #[must_use]
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            commands: self.commands_tx.clone(),
            events: self.broadcast.clone(),
            snapshot: self.snapshot.subscribe(),
        }
    }

    /// Resolved configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Run until `shutdown` resolves or a surface asks to exit
    ///
    /// # Errors
    ///
    /// Returns error if the daemon encounters a fatal error
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!(
            wake_phrase = %self.config.voice.wake_phrase,
            speak = %self.config.voice.speak_command.program,
            has_key = self.config.has_key(),
            "daemon running"
        );

        if self.config.voice.sweep_orphans {
            sweep_orphans(&self.config.voice.speak_command.program).await;
        }

        if self.config.has_key() {
            match self.factory.backends(&self.config) {
                Ok(backends) => self.backends.replace(backends),
                Err(e) => tracing::warn!(error = %e, "backends unavailable"),
            }
        } else {
            tracing::warn!("no API key configured; waiting for one from a surface");
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(SurfaceCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.loop_events.recv() => self.emit(event),
            }
        }

        self.stop_loop().await;
        while let Ok(event) = self.loop_events.try_recv() {
            self.emit(event);
        }

        tracing::info!("daemon stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: SurfaceCommand) {
        match command {
            SurfaceCommand::ToggleListening => self.toggle().await,
            SurfaceCommand::InterruptSpeech => {
                if let Some(handle) = self.live_loop() {
                    handle.interrupt();
                }
            }
            SurfaceCommand::SubmitApiKey { api_key, reply } => {
                let response = self.save_api_key(&api_key);
                let _ = reply.send(response);
            }
            SurfaceCommand::GetConfig { reply } => {
                let _ = reply.send(ConfigView {
                    require_setup: self.config.requires_setup,
                    has_key: self.config.has_key(),
                });
            }
            SurfaceCommand::Shutdown => {}
        }
    }

    /// Interrupt speech, else stop, else start
    async fn toggle(&mut self) {
        // Speech may have started since the last select round
        self.drain_loop_events();
        let speaking = self.snapshot.borrow().speaking;

        match self.live_loop() {
            Some(handle) if speaking => {
                tracing::debug!("toggle: interrupting speech");
                handle.interrupt();
            }
            Some(handle) => {
                tracing::debug!("toggle: stopping");
                handle.stop();
            }
            None => {
                tracing::debug!("toggle: starting");
                self.start().await;
            }
        }
    }

    async fn start(&mut self) {
        // A stopping worker must finish publishing before a new one starts
        if let Some(previous) = self.voice_loop.take() {
            previous.stop();
            previous.join().await;
            self.drain_loop_events();
        }

        let services = match self.build_services() {
            Ok(services) => services,
            Err(e) => {
                self.report_start_failure(&e);
                return;
            }
        };

        self.voice_loop = Some(VoiceLoop::spawn(
            services,
            self.config.voice.clone(),
            self.loop_events_tx.clone(),
        ));
    }

    fn build_services(&self) -> Result<VoiceServices> {
        if self.backends.current().is_none() {
            let backends = self.factory.backends(&self.config)?;
            self.backends.replace(backends);
        }

        Ok(VoiceServices {
            capture: self.factory.capture(&self.config)?,
            speaker: self.factory.speaker(&self.config)?,
            backends: self.backends.clone(),
        })
    }

    fn report_start_failure(&self, error: &Error) {
        tracing::error!(error = %error, "cannot start listening");

        let message = match error {
            Error::ConfigurationMissing(_) if !self.config.has_key() => {
                "Please set your Gemini API key first.".to_string()
            }
            other => other.to_string(),
        };
        self.emit(SessionEvent::Log(format!("Error: {message}")));
        if error.is_fatal() {
            self.emit(SessionEvent::Fatal(message));
        } else {
            self.emit(SessionEvent::Status {
                message,
                state: StatusState::Error,
            });
        }
    }

    async fn stop_loop(&mut self) {
        if let Some(handle) = self.voice_loop.take() {
            handle.stop();
            handle.join().await;
        }
    }

    fn live_loop(&self) -> Option<&LoopHandle> {
        self.voice_loop.as_ref().filter(|h| !h.is_finished())
    }

    fn save_api_key(&mut self, api_key: &str) -> KeyResponse {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return KeyResponse {
                success: false,
                message: "API key cannot be empty.".to_string(),
            };
        }

        if let Err(e) = self.store.save_api_key(api_key) {
            tracing::error!(error = %e, path = %self.store.path().display(), "failed to save API key");
            return KeyResponse {
                success: false,
                message: "Failed to save API key.".to_string(),
            };
        }

        self.config.set_api_key(api_key);
        match self.factory.backends(&self.config) {
            Ok(backends) => self.backends.replace(backends),
            Err(e) => {
                tracing::error!(error = %e, "saved key but clients could not be rebuilt");
                let message = match e {
                    Error::ConfigurationMissing(detail) => {
                        format!("API key saved, but setup is incomplete: {detail}")
                    }
                    _ => "Invalid API key. Please check and try again.".to_string(),
                };
                self.emit(SessionEvent::Log(format!("Error: {message}")));
                return KeyResponse {
                    success: false,
                    message,
                };
            }
        }

        tracing::info!("API key updated");
        self.emit(SessionEvent::Log("API key updated.".to_string()));
        KeyResponse {
            success: true,
            message: "API key saved successfully!".to_string(),
        }
    }

    fn drain_loop_events(&mut self) {
        while let Ok(event) = self.loop_events.try_recv() {
            self.emit(event);
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.snapshot.send_modify(|snapshot| snapshot.apply(&event));
        // No subscribers is fine
        let _ = self.broadcast.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::generation::{GenerationResult, Generator};
    use crate::voice::{
        CaptureOutcome, ListenLimits, SpeechHandle, TranscriptResult, Transcriber,
        UtteranceRequest,
    };

    /// Capture that never hears anything
    struct Silence;

    #[async_trait]
    impl SpeechCapture for Silence {
        async fn listen(&self, _: ListenLimits) -> Result<CaptureOutcome> {
            std::future::pending().await
        }
    }

    struct Mute;

    #[async_trait]
    impl Speaker for Mute {
        async fn speak(&self, _: &str) -> Result<Box<dyn SpeechHandle>> {
            Err(Error::SpeechDispatch("muted".to_string()))
        }
    }

    struct Canned;

    #[async_trait]
    impl Transcriber for Canned {
        async fn transcribe(&self, _: &UtteranceRequest) -> TranscriptResult {
            TranscriptResult::Empty
        }
    }

    #[async_trait]
    impl Generator for Canned {
        async fn generate(&self, prompt: &str) -> GenerationResult {
            GenerationResult::Ok(prompt.to_string())
        }
    }

    /// Services that need a key, optionally failing with a setup error
    struct Stub {
        backend_error: Option<&'static str>,
    }

    impl ServiceFactory for Stub {
        fn capture(&self, _: &Config) -> Result<Arc<dyn SpeechCapture>> {
            Ok(Arc::new(Silence))
        }

        fn speaker(&self, _: &Config) -> Result<Arc<dyn Speaker>> {
            Ok(Arc::new(Mute))
        }

        fn backends(&self, config: &Config) -> Result<Backends> {
            if !config.has_key() {
                return Err(Error::ConfigurationMissing("no key".to_string()));
            }
            if let Some(detail) = self.backend_error {
                return Err(Error::ConfigurationMissing(detail.to_string()));
            }
            Ok(Backends {
                transcriber: Arc::new(Canned),
                generator: Arc::new(Canned),
            })
        }
    }

    fn daemon_with(dir: &tempfile::TempDir, backend_error: Option<&'static str>) -> Daemon {
        let store = ConfigStore::new(dir.path().join("config.toml"));
        let config = Config::resolve(
            crate::config::AssistantConfigFile::default(),
            store.path().to_path_buf(),
            |_| None,
        )
        .unwrap();
        Daemon::with_factory(config, store, Arc::new(Stub { backend_error }))
    }

    fn daemon(dir: &tempfile::TempDir) -> Daemon {
        daemon_with(dir, None)
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(&dir);

        let response = daemon.save_api_key("   ");
        assert!(!response.success);
        assert_eq!(response.message, "API key cannot be empty.");
        assert!(!daemon.config.has_key());
    }

    #[tokio::test]
    async fn saved_key_clears_setup_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(&dir);

        let response = daemon.save_api_key("AIza-test");
        assert!(response.success);
        assert_eq!(response.message, "API key saved successfully!");
        assert!(daemon.config.has_key());
        assert!(!daemon.config.requires_setup);
        assert!(daemon.backends.current().is_some());
    }

    #[tokio::test]
    async fn key_without_usable_clients_is_not_reported_as_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon_with(&dir, Some("OPENAI_API_KEY required for Whisper"));
        let mut events = daemon.handle().subscribe();

        let response = daemon.save_api_key("AIza-test");
        assert!(!response.success);
        assert!(response.message.contains("OPENAI_API_KEY"));
        assert!(daemon.backends.current().is_none());

        daemon.toggle().await;
        assert!(daemon.voice_loop.is_none());

        let mut fatal = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Fatal(message) = event {
                fatal = Some(message);
            }
        }
        let fatal = fatal.expect("start failure reported");
        assert!(fatal.contains("OPENAI_API_KEY"));
        assert!(!fatal.contains("Please set your Gemini API key first."));
    }

    #[tokio::test]
    async fn start_without_key_reports_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(&dir);
        let mut events = daemon.handle().subscribe();

        daemon.toggle().await;

        assert!(daemon.voice_loop.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Log("Error: Please set your Gemini API key first.".to_string())
        );
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Fatal(_)));
        assert!(!daemon.handle().snapshot().running);
    }

    #[tokio::test]
    async fn toggle_sees_queued_speech_and_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = daemon(&dir);
        assert!(daemon.save_api_key("AIza-test").success);

        daemon.toggle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(daemon.live_loop().is_some());

        // Playback started but the event is still queued
        daemon
            .loop_events_tx
            .send(SessionEvent::SpeakingChanged(true))
            .unwrap();

        daemon.toggle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(daemon.snapshot.borrow().speaking);
        assert!(daemon.live_loop().is_some(), "toggle stopped the loop");

        daemon.stop_loop().await;
    }
}
