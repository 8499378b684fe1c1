//! Status notification sinks.
//!
//! Workers call [`NotificationSink::publish`] while holding their own lock, so
//! implementations must return promptly and must never call back into a worker.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::channel::{build_topic, ControlChannel, Envelope};
use crate::models::{OnlineStatus, StatusPayload, StatusUpdate};
use crate::stats::ProcessStats;

pub trait NotificationSink: Send + Sync + 'static {
    fn publish(&self, update: &StatusUpdate);
}

/// Publishes status updates on `<base>/<target>/status`.
pub struct ChannelSink {
    channel: Arc<dyn ControlChannel>,
    topic_base: String,
    stats: Arc<ProcessStats>,
}

impl ChannelSink {
    pub fn new(channel: Arc<dyn ControlChannel>, topic_base: impl Into<String>, stats: Arc<ProcessStats>) -> Self {
        Self {
            channel,
            topic_base: topic_base.into(),
            stats,
        }
    }
}

impl NotificationSink for ChannelSink {
    fn publish(&self, update: &StatusUpdate) {
        let topic = build_topic(&self.topic_base, Some(&update.target), "status");
        let result = Envelope::new(topic, &StatusPayload::from(update))
            .and_then(|envelope| self.channel.publish(envelope));
        match result {
            Ok(()) => self.stats.record_published(),
            Err(e) => {
                self.stats.record_error();
                error!(addr = %update.target, "Failed to publish status: {}", e);
            }
        }
    }
}

/// Posts real transitions to an HTTP webhook. Delivery happens on a spawned
/// task; failures are logged and dropped.
pub struct WebhookSink {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_client: reqwest::Client::new(),
        }
    }

    fn payload(update: &StatusUpdate) -> serde_json::Value {
        let color = match update.status {
            OnlineStatus::Online => 0x2ECC71,
            OnlineStatus::Offline => 0xE74C3C,
            OnlineStatus::Unknown => 0x95A5A6,
        };
        serde_json::json!({
            "username": "NetPulse Pinger",
            "embeds": [{
                "title": "Liveness Status Transition",
                "color": color,
                "fields": [
                    { "name": "Target", "value": update.target, "inline": true },
                    { "name": "Status", "value": update.status.to_string(), "inline": true },
                    { "name": "Source", "value": format!("{:?}", update.source), "inline": true },
                    { "name": "Last Seen", "value": update.last_seen.map_or("never".to_string(), |t| t.to_rfc3339()), "inline": false }
                ],
                "timestamp": Utc::now().to_rfc3339(),
            }]
        })
    }
}

impl NotificationSink for WebhookSink {
    fn publish(&self, update: &StatusUpdate) {
        if !update.source.is_transition() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(addr = %update.target, "No runtime available for webhook delivery");
            return;
        };
        let request = self.http_client.post(&self.url).json(&Self::payload(update));
        let target = update.target.clone();
        runtime.spawn(async move {
            match request.send().await {
                Ok(rsp) if rsp.status().is_success() => {
                    info!(addr = %target, "Webhook delivered");
                }
                Ok(rsp) => warn!(addr = %target, "Webhook rejected: HTTP {}", rsp.status()),
                Err(e) => warn!(addr = %target, "Webhook delivery failed: {}", e),
            }
        });
    }
}

#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutSink {
    fn publish(&self, update: &StatusUpdate) {
        for sink in &self.sinks {
            sink.publish(update);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::channel::testing::RecordingChannel;
    use crate::models::UpdateSource;

    fn update(source: UpdateSource) -> StatusUpdate {
        StatusUpdate {
            target: "10.0.0.5".into(),
            status: OnlineStatus::Online,
            last_seen: Some(Utc::now()),
            source,
        }
    }

    #[test]
    fn test_channel_sink_topic_and_payload() {
        let channel = Arc::new(RecordingChannel::default());
        let stats = Arc::new(ProcessStats::new());
        let sink = ChannelSink::new(channel.clone(), "netpulse", stats.clone());

        sink.publish(&update(UpdateSource::ProbeSuccess));

        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "netpulse/10.0.0.5/status");
        assert_eq!(sent[0].payload["status"], "online");
        assert_eq!(sent[0].payload["updateSource"], "probe-success");
        assert_eq!(stats.counters().published, 1);
    }

    #[test]
    fn test_channel_sink_counts_closed_channel_as_error() {
        let channel = Arc::new(crate::channel::BroadcastChannel::new());
        channel.close();
        let stats = Arc::new(ProcessStats::new());
        let sink = ChannelSink::new(channel, "netpulse", stats.clone());

        sink.publish(&update(UpdateSource::Heartbeat));
        assert_eq!(stats.counters().errors, 1);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.publish(&update(UpdateSource::Heartbeat));
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_webhook_payload_fields() {
        let payload = WebhookSink::payload(&update(UpdateSource::LivenessTimer));
        let fields = &payload["embeds"][0]["fields"];
        assert_eq!(fields[0]["value"], "10.0.0.5");
        assert_eq!(fields[1]["value"], "online");
    }
}
