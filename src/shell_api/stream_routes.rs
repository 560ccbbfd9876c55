//! Push channels: host events over SSE and the iframe broker over WebSocket.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::Response;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{SinkExt, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;
use crate::broker::{ChannelSource, MessageSource};
use crate::events::ShellEvent;

fn sse_event(event: &ShellEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event(event.name()).data(json)),
        Err(e) => {
            tracing::warn!(event = event.name(), "failed to serialize event: {e}");
            None
        }
    }
}

/// GET /events: the current plugin list first, then every host event.
pub(super) async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let snapshot = ShellEvent::PluginPaths(state.lifecycle.details().to_vec());

    let stream = async_stream::stream! {
        if let Some(event) = sse_event(&snapshot) {
            yield Ok(event);
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(event) = sse_event(&event) {
                        yield Ok(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /broker: one socket per plugin iframe. The page's `Origin` header is
/// the origin every message on the socket is checked against.
pub(super) async fn broker_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| handle_broker_socket(socket, origin, state))
}

async fn handle_broker_socket(socket: WebSocket, origin: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (source, mut rx) = ChannelSource::channel();

    // Replies and broadcasts for this iframe
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("failed to serialize iframe message: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let source: Arc<dyn MessageSource> = source;
    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let raw: serde_json::Value = match serde_json::from_str(text.as_str()) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%origin, "non-JSON broker frame dropped: {e}");
                continue;
            }
        };
        // Sequential per socket
        let outcome = state.broker.handle(&origin, source.clone(), raw).await;
        tracing::trace!(%origin, ?outcome, "broker message handled");
    }

    send_task.abort();
}
