use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{BoxError, Json};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::error::RelayError;
use super::normalize::{self, NormalizedEvent};
use super::types::{ContentEvent, RelayReply, RelayRequest};
use super::RelayState;
use crate::providers::{ChatMessage, ChatRequest, ProviderError};
use crate::stream::DONE_SENTINEL;

pub const FALLBACK_REPLY: &str = "Maaf, saya tidak bisa merespon saat ini.";

#[derive(serde::Serialize)]
pub struct Health {
    status: &'static str,
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

// POST /chat
pub async fn chat(State(state): State<RelayState>, body: Bytes) -> Result<Response, RelayError> {
    let request = parse_request(&body)?;

    let api_key = state.config.api_key().ok_or_else(|| {
        RelayError::Configuration("OpenRouter API key not configured".to_string())
    })?;

    tracing::debug!(
        chat_id = request.chat_id.as_deref().unwrap_or("-"),
        messages = request.messages.len(),
        stream = request.stream,
        "Relaying chat request"
    );

    let upstream_request = ChatRequest {
        api_key: api_key.to_string(),
        model: state.config.model.clone(),
        messages: request
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect(),
    };

    if request.stream {
        return relay_stream(&state, upstream_request).await;
    }

    let limit = state.config.idle_timeout();
    let response = timeout(limit, state.provider.send_message(upstream_request))
        .await
        .map_err(|_| ProviderError::Timeout(limit))??;
    tracing::debug!(model = %response.model, "Upstream reply received");
    let reply = response
        .content
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| FALLBACK_REPLY.to_string());

    Ok(Json(RelayReply {
        reply,
        chat_id: request.chat_id,
    })
    .into_response())
}

fn parse_request(body: &[u8]) -> Result<RelayRequest, RelayError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|e| RelayError::Internal(e.to_string()))?;

    if !payload.get("messages").is_some_and(Value::is_array) {
        return Err(RelayError::Validation(
            "Messages array is required".to_string(),
        ));
    }

    serde_json::from_value(payload)
        .map_err(|e| RelayError::Validation(format!("Invalid chat request: {}", e)))
}

async fn relay_stream(state: &RelayState, request: ChatRequest) -> Result<Response, RelayError> {
    let limit = state.config.idle_timeout();
    // Bounds the wait for upstream response headers; the pump bounds each read after that.
    let upstream = timeout(limit, state.provider.open_stream(request))
        .await
        .map_err(|_| ProviderError::Timeout(limit))??;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(normalize::pump(upstream, tx, limit));

    let events = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| -> Result<Event, BoxError> {
        match event? {
            NormalizedEvent::Content(content) => {
                Ok(Event::default().json_data(ContentEvent { content })?)
            }
            NormalizedEvent::Done => Ok(Event::default().data(DONE_SENTINEL)),
        }
    });

    Ok(Sse::new(events).into_response())
}
