//! Console and Prometheus sinks shared by the Decision Log and Status
//! plugins (§4.H stage 4 "Console fallback", §4.I).
//!
//! Remote delivery of decision-log chunks and status snapshots goes through
//! `agent-http::ServiceClient` directly in those plugins, since it already
//! carries the credential/retry/TLS machinery §4.A describes; this crate
//! only covers the two sinks that have nothing to do with a configured
//! service: writing to the local log, and exporting Prometheus metrics.

use agent_types::{PluginState, StatusSnapshot};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to register prometheus collector: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode prometheus metrics: {0}")]
    Encode(String),
}

/// Logs a serializable payload at `info` level under a named channel
/// (§4.H "events are also written to a local sink at info level").
pub struct ConsoleSink {
    channel: &'static str,
}

impl ConsoleSink {
    pub fn new(channel: &'static str) -> Self {
        Self { channel }
    }

    pub fn emit<T: Serialize>(&self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => tracing::info!(channel = self.channel, payload = %value, "console sink"),
            Err(err) => tracing::warn!(channel = self.channel, error = %err, "console sink failed to serialize payload"),
        }
    }
}

/// Prometheus metrics shared by the decision-log and status plugins.
pub struct PrometheusSink {
    registry: Registry,
    decision_logs_total: IntCounterVec,
    decision_logs_dropped_total: IntCounter,
    plugin_status: IntGaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, WebhookError> {
        let registry = Registry::new();

        let decision_logs_total = IntCounterVec::new(
            Opts::new("agent_decision_logs_total", "Decision log events accepted into the buffer, by bundle"),
            &["bundle"],
        )?;
        let decision_logs_dropped_total = IntCounter::new(
            "agent_decision_logs_dropped_total",
            "Decision log events dropped by the admission policy",
        )?;
        let plugin_status = IntGaugeVec::new(
            Opts::new("agent_plugin_status", "Plugin readiness: 0=not_ready, 1=ok, 2=err"),
            &["plugin"],
        )?;

        registry.register(Box::new(decision_logs_total.clone()))?;
        registry.register(Box::new(decision_logs_dropped_total.clone()))?;
        registry.register(Box::new(plugin_status.clone()))?;

        Ok(Self {
            registry,
            decision_logs_total,
            decision_logs_dropped_total,
            plugin_status,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decision(&self, bundle: &str) {
        self.decision_logs_total.with_label_values(&[bundle]).inc();
    }

    pub fn record_decision_dropped(&self) {
        self.decision_logs_dropped_total.inc();
    }

    pub fn record_plugin_status(&self, plugin: &str, state: PluginState) {
        let value = match state {
            PluginState::NotReady => 0,
            PluginState::Ok => 1,
            PluginState::Err => 2,
        };
        self.plugin_status.with_label_values(&[plugin]).set(value);
    }

    pub fn record_status_snapshot(&self, snapshot: &StatusSnapshot) {
        for (name, status) in &snapshot.plugins {
            self.record_plugin_status(name, status.state);
        }
    }

    /// Render the registry in Prometheus text exposition format, for a
    /// `/metrics` handler.
    pub fn gather(&self) -> Result<String, WebhookError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| WebhookError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| WebhookError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_types::{BundleStatus, PluginStatus};
    use std::collections::BTreeMap;

    #[test]
    fn console_sink_does_not_panic_on_serializable_payload() {
        let sink = ConsoleSink::new("decision_logs");
        sink.emit(&serde_json::json!({"decision_id": "abc"}));
    }

    #[test]
    fn prometheus_sink_records_and_gathers_decision_counts() {
        let sink = PrometheusSink::new().expect("new sink");
        sink.record_decision("main");
        sink.record_decision("main");
        sink.record_decision_dropped();

        let text = sink.gather().expect("gather");
        assert!(text.contains("agent_decision_logs_total"));
        assert!(text.contains("agent_decision_logs_dropped_total"));
    }

    #[test]
    fn prometheus_sink_records_plugin_status() {
        let sink = PrometheusSink::new().expect("new sink");
        sink.record_plugin_status("bundle.main", PluginState::Ok);

        let text = sink.gather().expect("gather");
        assert!(text.contains("agent_plugin_status"));
        assert!(text.contains("bundle.main"));
    }

    #[test]
    fn prometheus_sink_records_status_snapshot() {
        let sink = PrometheusSink::new().expect("new sink");
        let mut plugins = BTreeMap::new();
        plugins.insert("discovery".to_string(), PluginStatus { state: PluginState::Err });
        let snapshot = StatusSnapshot {
            plugins,
            bundles: BTreeMap::<String, BundleStatus>::new(),
            ..Default::default()
        };

        sink.record_status_snapshot(&snapshot);
        let text = sink.gather().expect("gather");
        assert!(text.contains("discovery"));
    }
}
