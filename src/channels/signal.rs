use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::interaction::orchestrator::ConversationOrchestrator;
use crate::types::{Channel, FriendshipId, InboundMessage, MessageId, UserMessage};

/// Sends JSON-RPC requests to the signal-cli HTTP endpoint.
pub struct SignalSender {
    http: reqwest::Client,
    api_url: String,
    next_id: AtomicU64,
}

impl SignalSender {
    pub fn new(api_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn send_message(&self, recipient: &str, text: &str) -> anyhow::Result<()> {
        self.rpc("send", json!({ "recipient": recipient, "message": text }))
            .await
    }

    pub async fn send_receipt(&self, recipient: &str, target_timestamp: i64) -> anyhow::Result<()> {
        self.rpc(
            "sendReceipt",
            json!({ "recipient": recipient, "targetTimestamps": [target_timestamp] }),
        )
        .await
    }

    pub async fn send_typing(&self, recipient: &str, stop: bool) -> anyhow::Result<()> {
        let mut params = json!({ "recipients": [recipient] });
        if stop {
            params["stop"] = Value::Bool(true);
        }
        self.rpc("sendTyping", params).await
    }

    async fn rpc(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        let response = self
            .http
            .post(format!("{}/rpc", self.api_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body, "signal-cli rejected {method} request");
            anyhow::bail!("signal-cli returned {status} for {method}");
        }
        Ok(())
    }
}

/// Minimal JSON structure matching the events signal-cli emits.
#[derive(Debug, Deserialize)]
struct SignalRpcEvent {
    envelope: Option<Envelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    source: Option<String>,
    source_number: Option<String>,
    timestamp: Option<i64>,
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
struct DataMessage {
    message: Option<String>,
}

/// Turn one signal-cli event into an inbound message. Reactions, receipts and
/// typing notifications carry no data message and are dropped here.
fn inbound_from_event(raw: &str) -> Option<InboundMessage> {
    let event: SignalRpcEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(err) => {
            warn!("Unparseable signal event: {err}");
            return None;
        }
    };
    let envelope = event.envelope?;
    let text = envelope.data_message?.message?;
    if text.trim().is_empty() {
        return None;
    }
    let source = envelope.source_number.or(envelope.source)?;
    let timestamp = envelope.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
    let received_at = chrono::DateTime::from_timestamp_millis(timestamp).unwrap_or_else(Utc::now);
    Some(InboundMessage {
        friendship_id: FriendshipId(source),
        message: UserMessage::new(
            MessageId(timestamp.to_string()),
            received_at,
            text,
            Channel::Signal,
        ),
    })
}

/// Receives messages from signal-cli's SSE endpoint and feeds them to the
/// orchestrator, one message at a time per process.
pub struct SignalChannel {
    http: reqwest::Client,
    api_url: String,
    sender: Arc<SignalSender>,
    orchestrator: Arc<ConversationOrchestrator>,
}

impl SignalChannel {
    pub fn new(
        api_url: &str,
        sender: Arc<SignalSender>,
        orchestrator: Arc<ConversationOrchestrator>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            sender,
            orchestrator,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let initial_backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);
        let stable_threshold = Duration::from_secs(60);
        let mut backoff = initial_backoff;

        loop {
            info!(api_url = %self.api_url, "Connecting to signal-cli event stream");
            let started = tokio::time::Instant::now();
            if let Err(err) = self.receive().await {
                error!("Signal event stream failed: {err}");
            }
            let ran_for = started.elapsed();

            if ran_for >= stable_threshold {
                backoff = initial_backoff;
            }

            warn!(
                backoff_secs = backoff.as_secs(),
                ran_for_secs = ran_for.as_secs(),
                "Signal event stream stopped, reconnecting"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    async fn receive(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .get(format!("{}/events", self.api_url))
            .send()
            .await?
            .error_for_status()?;
        info!("Connected to signal-cli SSE endpoint");

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Some(inbound) = inbound_from_event(data.trim()) else {
                    continue;
                };
                self.handle(inbound).await;
            }
        }
        Ok(())
    }

    async fn handle(&self, inbound: InboundMessage) {
        let recipient = inbound.friendship_id.0.clone();
        debug!(friendship_id = %inbound.friendship_id, "Received message");

        if let Ok(timestamp) = inbound.message.message_id.0.parse::<i64>() {
            if let Err(err) = self.sender.send_receipt(&recipient, timestamp).await {
                warn!("Sending read receipt failed: {err}");
            }
        }
        let _ = self.sender.send_typing(&recipient, false).await;

        if let Err(err) = self.orchestrator.on_message(&inbound).await {
            error!(friendship_id = %inbound.friendship_id, "Processing message failed: {err}");
        }

        let _ = self.sender.send_typing(&recipient, true).await;
    }
}
