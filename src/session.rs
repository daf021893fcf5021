//! Session state and the events the voice loop publishes
//!
//! The voice loop owns the only mutable [`SessionState`]. Observers (UI
//! surfaces, tests) never read it directly; they receive ordered
//! [`SessionEvent`]s and fold them into a [`SessionSnapshot`].

use serde::Serialize;

/// Stage of the current voice interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Not running
    #[default]
    Idle,
    /// Listening for the wake phrase
    AwaitingWake,
    /// Wake phrase heard, about to acknowledge
    Acknowledging,
    /// Listening for the user's command
    AwaitingCommand,
    /// Waiting for the generation service
    Generating,
    /// Speech playback in progress
    Speaking,
}

/// Visual state hint attached to status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Idle,
    Listening,
    Processing,
    Thinking,
    Speaking,
    Error,
}

/// Label of the single control button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonLabel {
    StartListening,
    Stop,
    StopSpeaking,
}

impl ButtonLabel {
    /// Button text
    #[must_use]
    pub const fn text(self) -> &'static str {
        match self {
            Self::StartListening => "Start Listening",
            Self::Stop => "Stop",
            Self::StopSpeaking => "Stop Speaking",
        }
    }

    /// Button color name used by the browser front-end
    #[must_use]
    pub const fn color(self) -> &'static str {
        match self {
            Self::StartListening => "blue",
            Self::Stop | Self::StopSpeaking => "red",
        }
    }
}

/// Event published by the voice loop after each transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// One-line status text
    Status { message: String, state: StatusState },
    /// Append-only log entry
    Log(String),
    /// Stage transition
    StageChanged(Stage),
    /// Speech playback started or ended
    SpeakingChanged(bool),
    /// Loop started or stopped
    RunningChanged(bool),
    /// Control button label
    Button(ButtonLabel),
    /// Error that needs user action
    Fatal(String),
}

/// Process-wide session state, mutated only by the voice loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    running: bool,
    speaking: bool,
    stage: Stage,
}

impl SessionState {
    /// Whether the loop is running
    #[must_use]
    pub const fn running(&self) -> bool {
        self.running
    }

    /// Whether speech playback is in progress
    #[must_use]
    pub const fn speaking(&self) -> bool {
        self.speaking
    }

    /// Current stage
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Mark the loop started
    pub fn start(&mut self) -> Vec<SessionEvent> {
        self.running = true;
        let mut events = vec![SessionEvent::RunningChanged(true)];
        events.extend(self.enter(Stage::AwaitingWake));
        events
    }

    /// Mark the loop stopped
    pub fn stop(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.speaking {
            events.extend(self.finish_speaking());
        }
        self.running = false;
        events.push(SessionEvent::RunningChanged(false));
        events.extend(self.enter(Stage::Idle));
        events
    }

    /// Move to a non-speaking stage
    ///
    /// `Speaking` is reachable only through [`Self::begin_speaking`].
    pub fn enter(&mut self, stage: Stage) -> Option<SessionEvent> {
        debug_assert!(stage != Stage::Speaking, "use begin_speaking");
        debug_assert!(!self.speaking, "stage change while speaking");
        if self.stage == stage {
            return None;
        }
        self.stage = stage;
        Some(SessionEvent::StageChanged(stage))
    }

    /// Enter `Speaking` with playback active
    pub fn begin_speaking(&mut self) -> Vec<SessionEvent> {
        self.speaking = true;
        let mut events = vec![SessionEvent::SpeakingChanged(true)];
        if self.stage != Stage::Speaking {
            self.stage = Stage::Speaking;
            events.push(SessionEvent::StageChanged(Stage::Speaking));
        }
        events
    }

    /// Leave playback; the stage stays `Speaking` until the next `enter`
    pub fn finish_speaking(&mut self) -> Vec<SessionEvent> {
        if !self.speaking {
            return Vec::new();
        }
        self.speaking = false;
        vec![SessionEvent::SpeakingChanged(false)]
    }
}

/// Observer-side view of the session, rebuilt from events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub running: bool,
    pub speaking: bool,
    pub stage: Stage,
    pub status: String,
    pub status_state: StatusState,
    pub button: ButtonLabel,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            running: false,
            speaking: false,
            stage: Stage::Idle,
            status: "Ready".to_string(),
            status_state: StatusState::Idle,
            button: ButtonLabel::StartListening,
        }
    }
}

impl SessionSnapshot {
    /// Fold one event into the snapshot
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Status { message, state } => {
                self.status.clone_from(message);
                self.status_state = *state;
            }
            SessionEvent::StageChanged(stage) => self.stage = *stage,
            SessionEvent::SpeakingChanged(speaking) => self.speaking = *speaking,
            SessionEvent::RunningChanged(running) => self.running = *running,
            SessionEvent::Button(label) => self.button = *label,
            SessionEvent::Fatal(message) => {
                self.status.clone_from(message);
                self.status_state = StatusState::Error;
            }
            SessionEvent::Log(_) => {}
        }
    }
}
