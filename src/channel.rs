//! Control channel abstraction.
//!
//! Every outbound message is an [`Envelope`] addressed by topic. The in-process
//! [`BroadcastChannel`] fans envelopes out to every subscriber; transports such
//! as the WebSocket endpoint subscribe to it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("control channel is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, ChannelError> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

pub trait ControlChannel: Send + Sync + 'static {
    fn publish(&self, envelope: Envelope) -> Result<(), ChannelError>;
}

/// Builds `<base>/<action>` or `<base>/<target>/<action>`.
pub fn build_topic(base: &str, target: Option<&str>, action: &str) -> String {
    match target {
        Some(target) => format!("{}/{}/{}", base, target, action),
        None => format!("{}/{}", base, action),
    }
}

pub struct BroadcastChannel {
    sender: broadcast::Sender<Envelope>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Fires once [`close`](Self::close) has been called; transports use it to
    /// drop their connections.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

impl ControlChannel for BroadcastChannel {
    fn publish(&self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        // no subscribers is not a delivery failure
        let _ = self.sender.send(envelope);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingChannel {
        pub sent: Mutex<Vec<Envelope>>,
    }

    impl RecordingChannel {
        pub fn take(&self) -> Vec<Envelope> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl ControlChannel for RecordingChannel {
        fn publish(&self, envelope: Envelope) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }
    }
}
