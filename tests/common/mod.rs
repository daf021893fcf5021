//! Shared test utilities: scripted stand-ins for the loop's services

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bible_voice::config::{AssistantConfigFile, Config, ConfigStore, VoiceConfig};
use bible_voice::daemon::ServiceFactory;
use bible_voice::voice::{
    BackendSlot, Backends, CaptureOutcome, ListenLimits, LoopHandle, SpeechCapture,
    SpeechHandle, Speaker, TranscriptResult, Transcriber, UtteranceRequest, VoiceLoop,
    VoiceServices,
};
use bible_voice::{Daemon, DaemonHandle, Error, GenerationResult, Generator, Result, SessionEvent};
use tokio::sync::mpsc;

/// Ordered record of every service call
#[derive(Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<String>>>,
    speaking: Arc<AtomicBool>,
    overlap: Arc<AtomicBool>,
}

impl Journal {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("speak:").map(str::to_string))
            .collect()
    }

    /// Whether a capture ever started while speech was playing
    pub fn capture_overlapped_speech(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

/// One scripted capture result
#[derive(Clone)]
pub enum Heard {
    Speech,
    Timeout,
}

/// Capture that replays a script, then waits forever
pub struct ScriptedCapture {
    script: Mutex<VecDeque<Heard>>,
    journal: Journal,
}

#[async_trait]
impl SpeechCapture for ScriptedCapture {
    async fn listen(&self, limits: ListenLimits) -> Result<CaptureOutcome> {
        if self.journal.speaking.load(Ordering::SeqCst) {
            self.journal.overlap.store(true, Ordering::SeqCst);
        }
        self.journal.record(match limits.start_timeout {
            Some(_) => "listen:command",
            None => "listen:wake",
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Heard::Speech) => Ok(CaptureOutcome::Captured(UtteranceRequest::from_samples(
                &[0.1; 160],
                16_000,
                limits,
            )?)),
            Some(Heard::Timeout) => Ok(CaptureOutcome::Timeout),
            None => std::future::pending().await,
        }
    }
}

/// Transcriber that replays a script
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<TranscriptResult>>,
    journal: Journal,
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _utterance: &UtteranceRequest) -> TranscriptResult {
        self.journal.record("transcribe");
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TranscriptResult::Empty)
    }
}

/// Generator that replays a script
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<GenerationResult>>,
    journal: Journal,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> GenerationResult {
        self.journal.record(format!("generate:{prompt}"));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| GenerationResult::Error("script exhausted".to_string()))
    }
}

/// Speaker that finishes at once, except for held texts which play until cancelled
pub struct FakeSpeaker {
    held: Vec<String>,
    journal: Journal,
}

#[async_trait]
impl Speaker for FakeSpeaker {
    async fn speak(&self, text: &str) -> Result<Box<dyn SpeechHandle>> {
        assert!(
            !self.journal.speaking.swap(true, Ordering::SeqCst),
            "speech started while another job was active"
        );
        self.journal.record(format!("speak:{text}"));
        Ok(Box::new(FakeJob {
            hold: self.held.iter().any(|h| h == text),
            journal: self.journal.clone(),
        }))
    }
}

struct FakeJob {
    hold: bool,
    journal: Journal,
}

#[async_trait]
impl SpeechHandle for FakeJob {
    async fn wait(&mut self) -> Result<()> {
        if self.hold {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.journal.speaking.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.journal.record("cancel");
        self.journal.speaking.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Script for one loop run
#[derive(Default)]
pub struct Script {
    pub heard: Vec<Heard>,
    pub transcripts: Vec<TranscriptResult>,
    pub generated: Vec<GenerationResult>,
    pub held_speech: Vec<String>,
    pub without_backends: bool,
    pub max_consecutive_failures: Option<u32>,
}

/// A spawned loop wired to scripted services
pub struct Harness {
    pub handle: LoopHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub journal: Journal,
    pub seen: Vec<SessionEvent>,
}

impl Harness {
    pub fn start(script: Script) -> Self {
        let journal = Journal::default();

        let backends = Backends {
            transcriber: Arc::new(ScriptedTranscriber {
                script: Mutex::new(script.transcripts.into()),
                journal: journal.clone(),
            }),
            generator: Arc::new(ScriptedGenerator {
                script: Mutex::new(script.generated.into()),
                journal: journal.clone(),
            }),
        };

        let services = VoiceServices {
            capture: Arc::new(ScriptedCapture {
                script: Mutex::new(script.heard.into()),
                journal: journal.clone(),
            }),
            speaker: Arc::new(FakeSpeaker {
                held: script.held_speech,
                journal: journal.clone(),
            }),
            backends: BackendSlot::new((!script.without_backends).then_some(backends)),
        };

        let (tx, events) = mpsc::unbounded_channel();
        let handle = VoiceLoop::spawn(services, test_voice_config(script.max_consecutive_failures), tx);

        Self {
            handle,
            events,
            journal,
            seen: Vec::new(),
        }
    }

    /// Receive events until one matches, returning it
    pub async fn wait_for(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("loop event channel closed");
                self.seen.push(event.clone());
                if matches(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Receive the next `AwaitingWake` stage change
    pub async fn wait_for_wake_listening(&mut self) {
        self.wait_for(|e| *e == SessionEvent::StageChanged(bible_voice::Stage::AwaitingWake))
            .await;
    }

    /// Log lines seen so far
    pub fn logs(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Log(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Stop the loop and collect remaining events
    pub async fn stop(mut self) -> Vec<SessionEvent> {
        self.handle.stop();
        tokio::time::timeout(Duration::from_secs(5), self.handle.join())
            .await
            .expect("loop did not stop");
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        assert!(
            !self.journal.capture_overlapped_speech(),
            "capture started while speaking"
        );
        self.seen
    }
}

pub fn test_voice_config(max_consecutive_failures: Option<u32>) -> VoiceConfig {
    VoiceConfig {
        retry_backoff: Duration::from_millis(10),
        max_consecutive_failures: max_consecutive_failures.unwrap_or(0),
        ..VoiceConfig::default()
    }
}

/// Factory with no hardware; clients are scripted and need a key
pub struct Offline;

impl ServiceFactory for Offline {
    fn capture(&self, _: &Config) -> Result<Arc<dyn SpeechCapture>> {
        Err(Error::Audio("no microphone".to_string()))
    }

    fn speaker(&self, _: &Config) -> Result<Arc<dyn Speaker>> {
        Err(Error::SpeechDispatch("no speaker".to_string()))
    }

    fn backends(&self, config: &Config) -> Result<Backends> {
        if !config.has_key() {
            return Err(Error::ConfigurationMissing("Gemini API key not set".to_string()));
        }

        let journal = Journal::default();
        Ok(Backends {
            transcriber: Arc::new(ScriptedTranscriber {
                script: Mutex::new(VecDeque::new()),
                journal: journal.clone(),
            }),
            generator: Arc::new(ScriptedGenerator {
                script: Mutex::new(VecDeque::new()),
                journal,
            }),
        })
    }
}

/// Start an offline daemon on a temporary config store
pub fn spawn_daemon(
    dir: &tempfile::TempDir,
) -> (DaemonHandle, ConfigStore, tokio::task::JoinHandle<Result<()>>) {
    let store = ConfigStore::new(dir.path().join("config.toml"));
    let config = Config::resolve(
        AssistantConfigFile::default(),
        store.path().to_path_buf(),
        |_| None,
    )
    .unwrap();

    let daemon = Daemon::with_factory(config, ConfigStore::new(store.path()), Arc::new(Offline));
    let handle = daemon.handle();
    let task = tokio::spawn(daemon.run(std::future::pending()));
    (handle, store, task)
}
