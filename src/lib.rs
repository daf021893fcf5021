//! Bible Voice - a voice-activated storytelling assistant
//!
//! Listens for a wake phrase, captures a spoken command, asks Gemini for
//! an answer in the voice of a biblical storyteller, and speaks it back
//! through the operating system's speech command.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Surfaces                          │
//! │      Browser (websocket bridge)  │  Console         │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands ▼   ▲ events
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Daemon                           │
//! │   config store  │  loop handle  │  event fan-out    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Voice loop                          │
//! │  capture │ transcribe │ generate │ speak            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod console;
pub mod daemon;
pub mod error;
pub mod gemini;
pub mod generation;
pub mod session;
pub mod setup;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, DaemonHandle};
pub use error::{Error, Result};
pub use generation::{GenerationResult, Generator};
pub use session::{SessionEvent, SessionSnapshot, SessionState, Stage};
