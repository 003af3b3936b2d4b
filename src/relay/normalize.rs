use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::providers::openrouter::models::OpenRouterStreamChunk;
use crate::providers::{ProviderError, UpstreamStream};
use crate::stream::{data_payload, LineBuffer, DONE_SENTINEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Content(String),
    Done,
}

/// Extracts text deltas from the provider's event lines.
#[derive(Debug, Default)]
pub struct UpstreamNormalizer {
    lines: LineBuffer,
}

impl UpstreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let lines = self.lines.push(chunk);
        lines.iter().filter_map(|line| extract_content(line)).collect()
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.lines
            .finish()
            .and_then(|line| extract_content(&line))
            .into_iter()
            .collect()
    }
}

fn extract_content(line: &str) -> Option<String> {
    let payload = data_payload(line.trim_start())?.trim();
    // The provider's own terminator; the relay emits its sentinel at end of body.
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    match serde_json::from_str::<OpenRouterStreamChunk>(payload) {
        Ok(chunk) => chunk.into_content().filter(|c| !c.is_empty()),
        Err(e) => {
            tracing::warn!("Parse error in upstream event: {}", e);
            None
        }
    }
}

/// Send an event downstream; if the client went away, stop reading upstream.
macro_rules! send_or_return {
    ($tx:expr, $event:expr) => {
        if $tx.send($event).await.is_err() {
            tracing::debug!("Relay client disconnected, dropping upstream stream");
            return;
        }
    };
}

/// Read the upstream body to the end, forwarding normalized events.
///
/// A read error or idle timeout is forwarded as `Err` and ends the pump
/// without a `Done` event.
pub async fn pump(
    mut upstream: UpstreamStream,
    tx: mpsc::Sender<Result<NormalizedEvent, ProviderError>>,
    idle_timeout: Duration,
) {
    let mut normalizer = UpstreamNormalizer::new();

    loop {
        let next = match tokio::time::timeout(idle_timeout, upstream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::error!("Upstream stream idle for {:?}", idle_timeout);
                let _ = tx.send(Err(ProviderError::Timeout(idle_timeout))).await;
                return;
            }
        };

        match next {
            Some(Ok(bytes)) => {
                for content in normalizer.push(&bytes) {
                    send_or_return!(tx, Ok(NormalizedEvent::Content(content)));
                }
            }
            Some(Err(e)) => {
                tracing::error!("Stream error: {}", e);
                let _ = tx.send(Err(e)).await;
                return;
            }
            None => break,
        }
    }

    for content in normalizer.finish() {
        send_or_return!(tx, Ok(NormalizedEvent::Content(content)));
    }
    let _ = tx.send(Ok(NormalizedEvent::Done)).await;
}
