//! Command dispatcher.
//!
//! Inbound topics are `<base>/get-stats` or `<base>/<target>/<action>`; each
//! command produces replies on the control channel:
//!
//! | command     | success                         | failure                    |
//! |-------------|---------------------------------|----------------------------|
//! | `get`       | `status` (explicit-query)       | `rsp` "not exist"          |
//! | `add`       | `rsp` "added" + `stats`         | `rsp` "already exist"      |
//! | `del`       | `rsp` "deleted" + `stats`       | `rsp` "not exist"          |
//! | `get-stats` | `stats`                         |                            |

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::channel::{build_topic, ControlChannel, Envelope};
use crate::models::{Feedback, SequencedRequest, StatusPayload, StatusUpdate, UpdateSource};
use crate::notify::NotificationSink;
use crate::registry::{Registry, RegistryError};
use crate::stats::ProcessStats;
use crate::utils::truncate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetStats,
    Get(String),
    Add(String),
    Del(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("unexpected topic format {0:?}")]
    Malformed(String),
    #[error("topic {0:?} is outside the configured base")]
    ForeignBase(String),
    #[error("unknown action {action:?} in topic {topic:?}")]
    UnknownAction { topic: String, action: String },
}

pub fn parse_topic(base: &str, topic: &str) -> Result<Command, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.first() != Some(&base) {
        return Err(TopicError::ForeignBase(topic.to_string()));
    }
    let unknown = |action: &str| TopicError::UnknownAction {
        topic: topic.to_string(),
        action: action.to_string(),
    };
    match segments.as_slice() {
        [_, "get-stats"] => Ok(Command::GetStats),
        [_, action] => Err(unknown(action)),
        [_, target, action] if !target.is_empty() => match *action {
            "get" => Ok(Command::Get(target.to_string())),
            "add" => Ok(Command::Add(target.to_string())),
            "del" => Ok(Command::Del(target.to_string())),
            other => Err(unknown(other)),
        },
        _ => Err(TopicError::Malformed(topic.to_string())),
    }
}

/// Reads `{"seq": n}` when the payload looks like JSON; anything else yields
/// the default request.
pub fn parse_request(payload: &[u8]) -> SequencedRequest {
    if payload.first() != Some(&b'{') {
        return SequencedRequest::default();
    }
    serde_json::from_slice(payload).unwrap_or_else(|e| {
        warn!(
            payload = %truncate(&String::from_utf8_lossy(payload), 80),
            "Malformed request payload: {}", e
        );
        SequencedRequest::default()
    })
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    channel: Arc<dyn ControlChannel>,
    on_status_change: Arc<dyn NotificationSink>,
    stats: Arc<ProcessStats>,
    topic_base: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        channel: Arc<dyn ControlChannel>,
        on_status_change: Arc<dyn NotificationSink>,
        stats: Arc<ProcessStats>,
        topic_base: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            channel,
            on_status_change,
            stats,
            topic_base: topic_base.into(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ProcessStats> {
        &self.stats
    }

    pub fn topic_base(&self) -> &str {
        &self.topic_base
    }

    /// Handles one inbound message. Malformed topics are logged and dropped
    /// without a reply.
    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        self.stats.record_received();
        debug!(
            topic,
            payload = %truncate(&String::from_utf8_lossy(payload), 80),
            "Command received"
        );
        let command = match parse_topic(&self.topic_base, topic) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping message: {}", e);
                return;
            }
        };
        let request = match command {
            Command::GetStats => SequencedRequest::default(),
            _ => parse_request(payload),
        };
        self.execute(command, &request).await;
    }

    pub async fn execute(&self, command: Command, request: &SequencedRequest) {
        match command {
            Command::GetStats => self.send_stats().await,
            Command::Get(target) => match self.registry.get(&target).await {
                Ok(worker) => {
                    let snapshot = worker.snapshot().await;
                    let update = StatusUpdate {
                        target: snapshot.target,
                        status: snapshot.status,
                        last_seen: snapshot.last_seen,
                        source: UpdateSource::ExplicitQuery,
                    };
                    self.publish(Some(&target), "status", &StatusPayload::from(&update));
                }
                Err(e) => self.send_feedback(request, &target, &e),
            },
            Command::Add(target) => {
                match self
                    .registry
                    .create(&target, Arc::clone(&self.on_status_change))
                    .await
                {
                    Ok(_) => {
                        self.send_ack(request, &target, "added");
                        self.send_stats().await;
                    }
                    Err(e) => self.send_feedback(request, &target, &e),
                }
            }
            Command::Del(target) => match self.registry.delete(&target).await {
                Ok(()) => {
                    self.send_ack(request, &target, "deleted");
                    self.send_stats().await;
                }
                Err(e) => self.send_feedback(request, &target, &e),
            },
        }
    }

    async fn send_stats(&self) {
        let snapshot = self.stats.snapshot(self.registry.len().await);
        self.publish(None, "stats", &snapshot);
    }

    fn send_ack(&self, request: &SequencedRequest, target: &str, message: &str) {
        self.publish(
            Some(target),
            "rsp",
            &Feedback {
                seq: request.seq,
                message: message.to_string(),
                is_error: false,
            },
        );
    }

    fn send_feedback(&self, request: &SequencedRequest, target: &str, error: &RegistryError) {
        debug!(addr = %target, "Command rejected: {}", error);
        let message = match error {
            RegistryError::AlreadyExists(_) => "already exist",
            RegistryError::NotFound(_) => "not exist",
        };
        self.publish(
            Some(target),
            "rsp",
            &Feedback {
                seq: request.seq,
                message: message.to_string(),
                is_error: true,
            },
        );
    }

    fn publish<T: Serialize>(&self, target: Option<&str>, action: &str, payload: &T) {
        let topic = build_topic(&self.topic_base, target, action);
        let result = Envelope::new(topic.as_str(), payload).and_then(|envelope| self.channel.publish(envelope));
        match result {
            Ok(()) => self.stats.record_published(),
            Err(e) => {
                self.stats.record_error();
                error!(topic, "Failed to publish: {}", e);
            }
        }
    }
}
