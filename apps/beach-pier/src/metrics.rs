use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;

/// Lifecycle events counted by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    ChannelCreated,
    ChannelCleanedUp,
    MemberAdded,
    MemberRemoved,
    ConnectionOpened,
    ConnectionClosed,
    UserCreated,
    UserCleanedUp,
}

impl MetricEvent {
    pub fn metric_name(self) -> &'static str {
        match self {
            MetricEvent::ChannelCreated => "pier_channels_created_total",
            MetricEvent::ChannelCleanedUp => "pier_channels_cleaned_total",
            MetricEvent::MemberAdded => "pier_channel_members_added_total",
            MetricEvent::MemberRemoved => "pier_channel_members_removed_total",
            MetricEvent::ConnectionOpened => "pier_connections_opened_total",
            MetricEvent::ConnectionClosed => "pier_connections_closed_total",
            MetricEvent::UserCreated => "pier_users_created_total",
            MetricEvent::UserCleanedUp => "pier_users_cleaned_total",
        }
    }
}

/// Fire-and-forget counter sink. Implementations must never block.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, instance: &str, event: MetricEvent);

    fn active_connections(&self, _instance: &str, _count: usize) {}
}

/// Sink paired with the instance label every event of one manager carries.
#[derive(Clone)]
pub struct InstanceMetrics {
    sink: Arc<dyn MetricsSink>,
    instance: Arc<str>,
}

impl InstanceMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>, instance: impl Into<Arc<str>>) -> Self {
        Self {
            sink,
            instance: instance.into(),
        }
    }

    pub fn record(&self, event: MetricEvent) {
        self.sink.increment(&self.instance, event);
    }

    pub fn active_connections(&self, count: usize) {
        self.sink.active_connections(&self.instance, count);
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }
}

/// Forwards events to the global `metrics` recorder, which the Prometheus
/// exporter renders on `/metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn increment(&self, instance: &str, event: MetricEvent) {
        counter!(event.metric_name(), 1, "instance" => instance.to_string());
    }

    fn active_connections(&self, instance: &str, count: usize) {
        gauge!(
            "pier_connections_active",
            count as f64,
            "instance" => instance.to_string()
        );
    }
}

/// In-memory sink used by tests and embedders that scrape counts directly.
#[derive(Debug, Default)]
pub struct CountingSink {
    counts: Mutex<HashMap<MetricEvent, u64>>,
}

impl CountingSink {
    pub fn count(&self, event: MetricEvent) -> u64 {
        self.counts.lock().get(&event).copied().unwrap_or(0)
    }
}

impl MetricsSink for CountingSink {
    fn increment(&self, _instance: &str, event: MetricEvent) {
        *self.counts.lock().entry(event).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn counting_sink_tracks_each_event() {
        let sink = CountingSink::default();
        sink.increment("a", MetricEvent::ChannelCreated);
        sink.increment("a", MetricEvent::ChannelCreated);
        sink.increment("b", MetricEvent::MemberRemoved);
        assert_eq!(sink.count(MetricEvent::ChannelCreated), 2);
        assert_eq!(sink.count(MetricEvent::MemberRemoved), 1);
        assert_eq!(sink.count(MetricEvent::ConnectionOpened), 0);
    }

    #[test_timeout::timeout]
    fn instance_metrics_share_the_sink() {
        let sink = Arc::new(CountingSink::default());
        let metrics = InstanceMetrics::new(sink.clone(), "pier-1");
        metrics.clone().record(MetricEvent::UserCreated);
        metrics.record(MetricEvent::UserCreated);
        assert_eq!(metrics.instance(), "pier-1");
        assert_eq!(sink.count(MetricEvent::UserCreated), 2);
    }
}
