use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dispatch::{CommandError, DispatchCommand, DispatchController, DispatchLimits};
use realtime::{ChannelError, RealtimeChannel, RealtimeEvent, SubscriberOptions, SubscriberSink};

const DEFAULT_CHARGE_SOC: f64 = 100.0;
const DEFAULT_DISCHARGE_SOC: f64 = 20.0;
const DEFAULT_DURATION_SECS: u64 = 3_600;

#[derive(Clone)]
pub struct AppState {
    pub channel: RealtimeChannel,
    pub dispatch: Arc<DispatchController>,
    pub limits: DispatchLimits,
    pub subscriber_options: SubscriberOptions,
}

pub fn router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/api/dispatch", post(dispatch_handler))
        .route("/api/dispatch/status", get(dispatch_status_handler))
        .with_state(state)
}

/// Messages a websocket client may send, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    RequestStatus,
    RequestPowerData,
}

/// Direct answer to a client message, if it warrants one.
///
/// Unknown or malformed messages are ignored. A power data request while the device
/// is not connected gets no reply rather than a stale snapshot.
pub fn reply_to(channel: &RealtimeChannel, text: &str) -> Option<RealtimeEvent> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "ignoring unrecognised client message");
            return None;
        }
    };

    match message {
        ClientMessage::Ping => Some(RealtimeEvent::pong()),
        ClientMessage::RequestStatus => {
            Some(RealtimeEvent::connection_status(channel.connection_state()))
        }
        ClientMessage::RequestPowerData => {
            if !channel.connection_state().is_connected() {
                return None;
            }
            channel.latest_snapshot().map(RealtimeEvent::power_update)
        }
    }
}

struct WsSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl SubscriberSink for WsSink {
    async fn send(&self, event: &RealtimeEvent) -> Result<(), ChannelError> {
        let text = event.to_json()?;
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink {
        sender: Mutex::new(sender),
    });

    let id = match state
        .channel
        .subscribe(sink.clone(), state.subscriber_options.clone())
    {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "rejecting websocket subscriber");
            return;
        }
    };
    info!(subscriber = %id, "websocket client connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(reply) = reply_to(&state.channel, &text) {
                    if let Err(err) = sink.send(&reply).await {
                        warn!(subscriber = %id, error = %err, "websocket reply failed");
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(subscriber = %id, error = %err, "websocket receive failed");
                break;
            }
        }
    }

    state.channel.unsubscribe(id);
    info!(subscriber = %id, "websocket client disconnected");
}

/// Body of `POST /api/dispatch`.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub command: String,
    pub power_w: Option<u32>,
    pub soc_percent: Option<f64>,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, PartialEq, Error)]
pub enum RequestError {
    #[error("unknown dispatch command '{0}'")]
    UnknownCommand(String),
    #[error("power_w is required for forced charge or discharge")]
    MissingPower,
    #[error(transparent)]
    Invalid(#[from] CommandError),
}

pub fn parse_command(
    request: &DispatchRequest,
    limits: DispatchLimits,
) -> Result<DispatchCommand, RequestError> {
    let duration = Duration::from_secs(request.duration_secs.unwrap_or(DEFAULT_DURATION_SECS));
    match request.command.as_str() {
        "stop" => Ok(DispatchCommand::stop()),
        "normal" => Ok(DispatchCommand::normal()),
        "prevent_discharge" => Ok(DispatchCommand::prevent_discharge()),
        "force_charge" => {
            let watts = request.power_w.ok_or(RequestError::MissingPower)?;
            let soc = request.soc_percent.unwrap_or(DEFAULT_CHARGE_SOC);
            Ok(DispatchCommand::force_charge(watts, soc, duration, limits)?)
        }
        "force_discharge" => {
            let watts = request.power_w.ok_or(RequestError::MissingPower)?;
            let soc = request.soc_percent.unwrap_or(DEFAULT_DISCHARGE_SOC);
            Ok(DispatchCommand::force_discharge(watts, soc, duration, limits)?)
        }
        other => Err(RequestError::UnknownCommand(other.to_string())),
    }
}

fn error_response(status: u16, message: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

async fn dispatch_handler(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Response {
    let command = match parse_command(&request, state.limits) {
        Ok(command) => command,
        Err(err) => return error_response(400, err.to_string()),
    };

    match state.dispatch.execute(command).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "mode": outcome.mode.as_str(),
            "command": outcome.command,
        }))
        .into_response(),
        Err(err) => {
            warn!(command = %request.command, error = %err, "dispatch request failed");
            error_response(err.status_code(), err.to_string())
        }
    }
}

async fn dispatch_status_handler(State(state): State<AppState>) -> Response {
    let active = state.dispatch.current_dispatch().map(|mode| mode.as_str());
    match state.dispatch.read_status().await {
        Ok(status) => Json(json!({
            "success": true,
            "active_dispatch": active,
            "device": status,
        }))
        .into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}
