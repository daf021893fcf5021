//! WebSocket bridge for the browser front-end
//!
//! One JSON message per event. Session events are forwarded as they
//! arrive; commands are answered on the same socket.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::daemon::DaemonHandle;
use crate::session::{SessionEvent, SessionSnapshot, StatusState};

/// Incoming WebSocket message from the front-end
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Smart start/stop/interrupt button
    Toggle,
    /// Stop speaking
    Interrupt,
    /// Persist a new API key
    SaveApiKey {
        #[serde(default)]
        api_key: String,
    },
    /// Ask for configuration state
    GetConfig,
}

/// Outgoing WebSocket message to the front-end
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    Status { message: String, state: StatusState },
    Log { message: String },
    Button { text: String, color: String },
    Speaking { speaking: bool },
    Config { require_setup: bool, has_key: bool },
    ApiKeyResponse { success: bool, message: String },
    Error { message: String },
}

impl WsOutgoing {
    /// Map a session event; stage and running changes have no front-end message
    #[must_use]
    pub fn from_event(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::Status { message, state } => Some(Self::Status {
                message: message.clone(),
                state: *state,
            }),
            SessionEvent::Log(message) => Some(Self::Log {
                message: message.clone(),
            }),
            SessionEvent::Button(label) => Some(Self::Button {
                text: label.text().to_string(),
                color: label.color().to_string(),
            }),
            SessionEvent::SpeakingChanged(speaking) => Some(Self::Speaking {
                speaking: *speaking,
            }),
            SessionEvent::Fatal(message) => Some(Self::Error {
                message: message.clone(),
            }),
            SessionEvent::StageChanged(_) | SessionEvent::RunningChanged(_) => None,
        }
    }

    /// Messages that bring a new client up to date
    #[must_use]
    pub fn replay(snapshot: &SessionSnapshot) -> Vec<Self> {
        vec![
            Self::Status {
                message: snapshot.status.clone(),
                state: snapshot.status_state,
            },
            Self::Button {
                text: snapshot.button.text().to_string(),
                color: snapshot.button.color().to_string(),
            },
            Self::Speaking {
                speaking: snapshot.speaking,
            },
        ]
    }
}

/// Build WebSocket router
pub fn router(daemon: DaemonHandle) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .with_state(daemon)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(daemon): State<DaemonHandle>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, daemon))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, daemon: DaemonHandle) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = daemon.subscribe();
    let client_id = uuid::Uuid::new_v4();

    tracing::info!(%client_id, "WebSocket connected");

    // Channel for replies and forwarded events
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(64);

    let mut greeting = Vec::new();
    match daemon.config().await {
        Ok(view) => greeting.push(WsOutgoing::Config {
            require_setup: view.require_setup,
            has_key: view.has_key,
        }),
        Err(e) => tracing::warn!(error = %e, "config unavailable for new client"),
    }
    greeting.extend(WsOutgoing::replay(&daemon.snapshot()));

    for message in greeting {
        if let Ok(text) = serde_json::to_string(&message) {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                reply = rx.recv() => match reply {
                    Some(message) => message,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => match WsOutgoing::from_event(&event) {
                        Some(message) => message,
                        None => continue,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "client lagging, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if let Ok(text) = serde_json::to_string(&message) {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Some(reply) = handle_message(&text, &daemon).await {
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => {
                    tracing::info!(%client_id, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::debug!(%client_id, "WebSocket disconnected");
}

/// Apply one client message; returns a direct reply if any
async fn handle_message(text: &str, daemon: &DaemonHandle) -> Option<WsOutgoing> {
    let incoming: WsIncoming = match serde_json::from_str(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::warn!(error = %e, "invalid WebSocket message");
            return Some(WsOutgoing::Error {
                message: format!("invalid message: {e}"),
            });
        }
    };

    tracing::debug!(?incoming, "WebSocket command");

    let result = match incoming {
        WsIncoming::Toggle => daemon.toggle().await.map(|()| None),
        WsIncoming::Interrupt => daemon.interrupt().await.map(|()| None),
        WsIncoming::SaveApiKey { api_key } => daemon
            .submit_api_key(api_key)
            .await
            .map(|response| {
                Some(WsOutgoing::ApiKeyResponse {
                    success: response.success,
                    message: response.message,
                })
            }),
        WsIncoming::GetConfig => daemon.config().await.map(|view| {
            Some(WsOutgoing::Config {
                require_setup: view.require_setup,
                has_key: view.has_key,
            })
        }),
    };

    result.unwrap_or_else(|e| {
        Some(WsOutgoing::Error {
            message: e.to_string(),
        })
    })
}
