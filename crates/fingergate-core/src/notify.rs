use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::events::{EventSink, IdentificationEvent};
use crate::identification::SCAN_TARGET;
use crate::record::timestamp_now;

pub const PLACEHOLDER_TOKEN: &str = "your-webhook-bearer-token-here";
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectType {
    Valid,
    Unidentified,
    Test,
}

/// Wire format posted to the webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookEnvelope {
    pub detecttype: DetectType,
    pub data: WebhookData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub timestamp: String,
    pub score: i32,
}

impl WebhookEnvelope {
    pub fn from_event(event: &IdentificationEvent) -> Self {
        match event {
            IdentificationEvent::Identified { record, score, at } => Self {
                detecttype: DetectType::Valid,
                data: WebhookData {
                    event: "fingerprint_detected".into(),
                    user_id: Some(record.id.clone()),
                    name: Some(record.name.clone()),
                    role: Some(record.role.to_string()),
                    timestamp: at.clone(),
                    score: *score,
                },
            },
            IdentificationEvent::Unidentified { at } => Self {
                detecttype: DetectType::Unidentified,
                data: WebhookData {
                    event: "fingerprint_unidentified".into(),
                    user_id: None,
                    name: None,
                    role: None,
                    timestamp: at.clone(),
                    score: 0,
                },
            },
        }
    }

    pub fn test() -> Self {
        Self {
            detecttype: DetectType::Test,
            data: WebhookData {
                event: "webhook_test".into(),
                user_id: None,
                name: None,
                role: None,
                timestamp: timestamp_now(),
                score: 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub queue_capacity: usize,
}

impl WebhookConfig {
    /// Returns `None` when no URL is configured. Blank and placeholder
    /// tokens are dropped.
    pub fn new(url: Option<String>, token: Option<String>, timeout: Duration) -> Option<Self> {
        let url = url.map(|value| value.trim().to_string())?;
        if url.is_empty() {
            return None;
        }
        let token = token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && value != PLACEHOLDER_TOKEN);
        Some(Self {
            url,
            token,
            timeout,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Outcome of one POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { status: u16 },
    Rejected { status: u16 },
}

pub trait WebhookTransport: Send + Sync {
    /// Transport failures are errors; any HTTP response is a `Delivery`.
    fn post(&self, config: &WebhookConfig, body: &str) -> AppResult<Delivery>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UreqTransport;

impl WebhookTransport for UreqTransport {
    fn post(&self, config: &WebhookConfig, body: &str) -> AppResult<Delivery> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout_read(config.timeout)
            .timeout_write(config.timeout)
            .build();
        let mut req = agent
            .post(&config.url)
            .set("content-type", "application/json")
            .set("accept", "application/json");
        if let Some(token) = config.token.as_ref() {
            req = req.set("authorization", &format!("Bearer {}", token));
        }
        match req.send_string(body) {
            Ok(resp) => Ok(classify(resp.status())),
            Err(ureq::Error::Status(code, _resp)) => Ok(classify(code)),
            Err(ureq::Error::Transport(err)) => {
                Err(AppError::Webhook(format!("transport error: {}", err)))
            }
        }
    }
}

fn classify(status: u16) -> Delivery {
    if (200..300).contains(&status) {
        Delivery::Delivered { status }
    } else {
        Delivery::Rejected { status }
    }
}

struct Outbox {
    sender: Option<SyncSender<WebhookEnvelope>>,
    worker: Option<JoinHandle<()>>,
}

/// Event sink that posts webhook envelopes from a single delivery thread.
///
/// Events are queued without blocking; a full queue drops the event.
pub struct WebhookNotifier {
    config: WebhookConfig,
    transport: Arc<dyn WebhookTransport>,
    outbox: Mutex<Outbox>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> AppResult<Self> {
        Self::with_transport(config, Arc::new(UreqTransport))
    }

    pub fn with_transport(
        config: WebhookConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> AppResult<Self> {
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity.max(1));
        let worker_config = config.clone();
        let worker_transport = Arc::clone(&transport);
        let worker = thread::Builder::new()
            .name("fingergate-webhook".into())
            .spawn(move || deliver_all(&worker_config, worker_transport.as_ref(), receiver))?;

        info!(url = %config.url, authorized = config.token.is_some(), "webhook notifier ready");
        Ok(Self {
            config,
            transport,
            outbox: Mutex::new(Outbox {
                sender: Some(sender),
                worker: Some(worker),
            }),
        })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub fn enqueue(&self, envelope: WebhookEnvelope) -> bool {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = outbox.sender.as_ref() else {
            return false;
        };
        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(url = %self.config.url, "webhook queue full; notification dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Sends a test envelope on the caller's thread.
    pub fn send_test(&self) -> AppResult<Delivery> {
        let envelope = WebhookEnvelope::test();
        deliver(&self.config, self.transport.as_ref(), &envelope)
    }

    /// Closes the queue and waits for queued deliveries to finish.
    pub fn shutdown(&self) {
        let worker = {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            outbox.sender.take();
            outbox.worker.take()
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("webhook worker panicked");
            }
        }
    }
}

impl EventSink for WebhookNotifier {
    fn notify(&self, event: &IdentificationEvent) {
        self.enqueue(WebhookEnvelope::from_event(event));
    }
}

impl Drop for WebhookNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver_all(
    config: &WebhookConfig,
    transport: &dyn WebhookTransport,
    receiver: Receiver<WebhookEnvelope>,
) {
    for envelope in receiver {
        // Failures are already logged to the scan log.
        let _ = deliver(config, transport, &envelope);
    }
    debug!("webhook worker exiting");
}

/// Posts one envelope and records the result in the scan log.
pub fn deliver(
    config: &WebhookConfig,
    transport: &dyn WebhookTransport,
    envelope: &WebhookEnvelope,
) -> AppResult<Delivery> {
    let body = serde_json::to_string(envelope)?;
    debug!(url = %config.url, payload = %body, "sending webhook");
    match transport.post(config, &body) {
        Ok(Delivery::Delivered { status }) => {
            info!(target: SCAN_TARGET, url = %config.url, status, "WEBHOOK | POST | OK");
            Ok(Delivery::Delivered { status })
        }
        Ok(Delivery::Rejected { status }) => {
            warn!(target: SCAN_TARGET, url = %config.url, status, "WEBHOOK | POST | FAILED");
            Ok(Delivery::Rejected { status })
        }
        Err(err) => {
            warn!(target: SCAN_TARGET, url = %config.url, error = %err, "WEBHOOK_ERROR | POST");
            Err(err)
        }
    }
}
