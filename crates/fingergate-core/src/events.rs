use std::sync::mpsc::{SyncSender, TrySendError};

use serde::Serialize;
use tracing::warn;

use crate::record::IdentityRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentificationEvent {
    Identified {
        record: IdentityRecord,
        score: i32,
        at: String,
    },
    Unidentified {
        at: String,
    },
}

impl IdentificationEvent {
    pub fn at(&self) -> &str {
        match self {
            IdentificationEvent::Identified { at, .. } => at,
            IdentificationEvent::Unidentified { at } => at,
        }
    }

    pub fn is_identified(&self) -> bool {
        matches!(self, IdentificationEvent::Identified { .. })
    }
}

/// Receives identification results. Called from the identification thread
/// without the arbiter lock held; implementations must return promptly.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &IdentificationEvent);
}

/// Forwards events into a bounded channel, dropping them when it is full.
pub struct ChannelEventSink {
    sender: SyncSender<IdentificationEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: SyncSender<IdentificationEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn notify(&self, event: &IdentificationEvent) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("identification event channel full; event dropped")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
