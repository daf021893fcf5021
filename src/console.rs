//! Terminal presentation surface
//!
//! Prints status and log lines as they arrive and reads one command per
//! line from stdin.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::Result;
use crate::daemon::DaemonHandle;
use crate::session::SessionEvent;

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Toggle,
    Interrupt,
    SetKey(String),
    Quit,
    Help,
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a line of input
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" | "t" | "toggle" => Self::Toggle,
            "i" | "interrupt" => Self::Interrupt,
            "q" | "quit" | "exit" => Self::Quit,
            "h" | "help" | "?" => Self::Help,
            _ => match line.strip_prefix("key") {
                Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                    Self::SetKey(rest.trim().to_string())
                }
                _ => Self::Unknown(line.to_string()),
            },
        }
    }
}

const HELP: &str = "Enter: start/stop (or stop speaking)  i: interrupt  key <KEY>: save API key  q: quit";

/// Render one event for the terminal; `None` for events with no console line
#[must_use]
pub fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Status { message, .. } => Some(format!("[status] {message}")),
        SessionEvent::Log(message) => Some(message.clone()),
        SessionEvent::Fatal(message) => Some(format!("[error] {message}")),
        SessionEvent::Button(label) => Some(format!("[button] {}", label.text())),
        SessionEvent::StageChanged(_)
        | SessionEvent::SpeakingChanged(_)
        | SessionEvent::RunningChanged(_) => None,
    }
}

/// Print events until the daemon goes away
pub async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = render(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "console lagging, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read commands from stdin until quit or end of input
///
/// # Errors
///
/// Returns error if stdin cannot be read
pub async fn run(daemon: DaemonHandle) -> Result<()> {
    run_with(daemon, BufReader::new(tokio::io::stdin())).await
}

/// Read commands from `input`
///
/// # Errors
///
/// Returns error if the input cannot be read
pub async fn run_with<R>(daemon: DaemonHandle, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let printer = tokio::spawn(print_events(daemon.subscribe()));
    println!("{HELP}");

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match ConsoleCommand::parse(&line) {
            ConsoleCommand::Toggle => daemon.toggle().await,
            ConsoleCommand::Interrupt => daemon.interrupt().await,
            ConsoleCommand::SetKey(key) => {
                let response = daemon.submit_api_key(key).await;
                if let Ok(response) = &response {
                    println!("{}", response.message);
                }
                response.map(|_| ())
            }
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ConsoleCommand::Unknown(other) => {
                println!("unknown command: {other}");
                Ok(())
            }
        };

        if sent.is_err() {
            break;
        }
    }

    let _ = daemon.shutdown().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ButtonLabel;

    #[test]
    fn parse_commands() {
        assert_eq!(ConsoleCommand::parse(""), ConsoleCommand::Toggle);
        assert_eq!(ConsoleCommand::parse(" i "), ConsoleCommand::Interrupt);
        assert_eq!(ConsoleCommand::parse("q"), ConsoleCommand::Quit);
        assert_eq!(
            ConsoleCommand::parse("key AIza123"),
            ConsoleCommand::SetKey("AIza123".to_string())
        );
        assert_eq!(ConsoleCommand::parse("key"), ConsoleCommand::SetKey(String::new()));
        assert_eq!(
            ConsoleCommand::parse("keyboard"),
            ConsoleCommand::Unknown("keyboard".to_string())
        );
    }

    #[test]
    fn render_skips_internal_events() {
        assert_eq!(
            render(&SessionEvent::Button(ButtonLabel::Stop)),
            Some("[button] Stop".to_string())
        );
        assert!(render(&SessionEvent::RunningChanged(true)).is_none());
    }
}
