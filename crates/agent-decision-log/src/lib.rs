//! Decision-log plugin: buffered event pipeline from ingest through upload
//! (§4.H).
//!
//! Stage 1 (mask/drop) runs synchronously from [`DecisionLogPlugin::log`].
//! Stages 2-4 (buffer, chunk, upload) run on the background task started by
//! [`DecisionLogPlugin::run`]. A `plugin: <name>` delegation (stage 1 only)
//! is represented by leaving [`DecisionLogPlugin::client`] unset and relying
//! entirely on the console sink, matching how `agent-bundle`'s `NoopVerifier`
//! represents "nothing configured" rather than threading an `Option` through
//! every call site.

mod mask;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use agent_config::{DecisionLogsConfig, ReportingAdmission, ReportingConfig};
use agent_http::{RequestSpec, ServiceClient};
use agent_retry::calculate_delay;
use agent_state::{Plugin, PluginError, PluginKind};
use agent_types::{DecisionEvent, Evaluator, PluginState};
use agent_webhook::ConsoleSink;
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

pub use mask::MaskOp;

#[derive(Debug, Error)]
pub enum DecisionLogError {
    #[error("failed to gzip-encode a chunk: {0}")]
    Gzip(#[from] std::io::Error),
}

enum BufferState {
    SizeLimited {
        queue: VecDeque<DecisionEvent>,
        limit_bytes: u64,
        used_bytes: u64,
    },
    RateLimited {
        queue: VecDeque<DecisionEvent>,
        capacity: f64,
        tokens: f64,
        rate_per_sec: f64,
        last_refill: Instant,
    },
}

impl BufferState {
    fn new(admission: Option<&ReportingAdmission>) -> Self {
        match admission {
            Some(ReportingAdmission::BufferSizeLimitBytes { buffer_size_limit_bytes }) => BufferState::SizeLimited {
                queue: VecDeque::new(),
                limit_bytes: *buffer_size_limit_bytes,
                used_bytes: 0,
            },
            Some(ReportingAdmission::MaxDecisionsPerSecond { max_decisions_per_second }) => BufferState::RateLimited {
                queue: VecDeque::new(),
                capacity: max_decisions_per_second.max(1.0),
                tokens: max_decisions_per_second.max(1.0),
                rate_per_sec: *max_decisions_per_second,
                last_refill: Instant::now(),
            },
            // No admission policy configured: an unbounded FIFO, same as a
            // size-limited buffer with no cap (§4.H "exactly one of two
            // admission policies is active" assumes one is always set; this
            // covers the config-absent case without a third code path).
            None => BufferState::SizeLimited {
                queue: VecDeque::new(),
                limit_bytes: u64::MAX,
                used_bytes: 0,
            },
        }
    }

    /// Admit `event`, evicting the oldest buffered events on overflow
    /// (size-limited) or dropping it outright when the bucket is empty
    /// (rate-limited). Returns `true` if the event was dropped.
    fn admit(&mut self, event: DecisionEvent) -> bool {
        match self {
            BufferState::SizeLimited { queue, limit_bytes, used_bytes } => {
                let size = event.approx_json_size() as u64;
                queue.push_back(event);
                *used_bytes += size;
                while *used_bytes > *limit_bytes {
                    let Some(evicted) = queue.pop_front() else { break };
                    *used_bytes = used_bytes.saturating_sub(evicted.approx_json_size() as u64);
                }
                false
            }
            BufferState::RateLimited { queue, capacity, tokens, rate_per_sec, last_refill } => {
                let now = Instant::now();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * *rate_per_sec).min(*capacity);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    queue.push_back(event);
                    false
                } else {
                    true
                }
            }
        }
    }

    fn drain_chunk(&mut self, upload_size_limit_bytes: u64) -> Vec<DecisionEvent> {
        let queue = match self {
            BufferState::SizeLimited { queue, used_bytes, .. } => {
                let chunk = drain_bounded(queue, upload_size_limit_bytes);
                for event in &chunk {
                    *used_bytes = used_bytes.saturating_sub(event.approx_json_size() as u64);
                }
                return chunk;
            }
            BufferState::RateLimited { queue, .. } => queue,
        };
        drain_bounded(queue, upload_size_limit_bytes)
    }
}

/// Pack events up to `upload_size_limit_bytes`, stripping `nd_builtin_cache`
/// from an event that alone would exceed the limit (§4.H stage 3).
fn drain_bounded(queue: &mut VecDeque<DecisionEvent>, upload_size_limit_bytes: u64) -> Vec<DecisionEvent> {
    let mut chunk = Vec::new();
    let mut used = 0u64;
    while let Some(mut event) = queue.pop_front() {
        let mut size = event.approx_json_size() as u64;
        if size > upload_size_limit_bytes && event.nd_builtin_cache.is_some() {
            event.strip_nd_builtin_cache();
            size = event.approx_json_size() as u64;
        }
        if !chunk.is_empty() && used + size > upload_size_limit_bytes {
            queue.push_front(event);
            break;
        }
        used += size;
        chunk.push(event);
        if used >= upload_size_limit_bytes {
            break;
        }
    }
    chunk
}

/// The decision-log pipeline for one configured `decision_logs` block
/// (§4.H). Owns the buffer and drives the uploader loop; ingest (`log`) is
/// called directly by the evaluator's embedder.
pub struct DecisionLogPlugin {
    client: Option<Arc<ServiceClient>>,
    resource: String,
    evaluator: Option<Arc<dyn Evaluator>>,
    mask_decision: Option<String>,
    drop_decision: Option<String>,
    reporting: ReportingConfig,
    console: Option<ConsoleSink>,
    buffer: Mutex<BufferState>,
    cancellation: CancellationToken,
    manual_trigger: Notify,
    dropped_total: AtomicU64,
    uploaded_total: AtomicU64,
}

impl DecisionLogPlugin {
    pub fn new(
        client: Option<Arc<ServiceClient>>,
        evaluator: Option<Arc<dyn Evaluator>>,
        config: &DecisionLogsConfig,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            resource: config.resource.clone().unwrap_or_else(|| "logs".to_string()),
            evaluator,
            mask_decision: config.mask_decision.clone(),
            drop_decision: config.drop_decision.clone(),
            reporting: config.reporting.clone(),
            console: config.console.then(|| ConsoleSink::new("decision_logs")),
            buffer: Mutex::new(BufferState::new(config.reporting.admission.as_ref())),
            cancellation,
            manual_trigger: Notify::new(),
            dropped_total: AtomicU64::new(0),
            uploaded_total: AtomicU64::new(0),
        })
    }

    pub fn trigger(&self) {
        self.manual_trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn uploaded_total(&self) -> u64 {
        self.uploaded_total.load(Ordering::Relaxed)
    }

    /// Stage 1: consult mask/drop decisions, then admit into the buffer
    /// (§4.H "Ingest").
    pub async fn log(self: &Arc<Self>, mut event: DecisionEvent) {
        if let (Some(query), Some(evaluator)) = (&self.drop_decision, &self.evaluator) {
            match evaluator.evaluate(query, mask::decision_input(&event)).await {
                Ok(Some(serde_json::Value::Bool(true))) => {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(decision = %query, error = %err, "drop decision evaluation failed"),
            }
        }

        if let (Some(query), Some(evaluator)) = (&self.mask_decision, &self.evaluator) {
            match evaluator.evaluate(query, mask::decision_input(&event)).await {
                Ok(Some(value)) => match serde_json::from_value::<Vec<MaskOp>>(value) {
                    Ok(ops) => event = mask::apply(event, &ops),
                    Err(err) => tracing::warn!(decision = %query, error = %err, "mask decision returned an unexpected shape"),
                },
                Ok(None) => {}
                Err(err) => tracing::warn!(decision = %query, error = %err, "mask decision evaluation failed"),
            }
        }

        let dropped = self.buffer.lock().await.admit(event);
        if dropped {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stage 3/4 uploader loop: jittered periodic wakeups or manual
    /// triggers, draining and uploading one chunk per wakeup until the
    /// buffer is empty (§4.H "Chunker").
    pub async fn run(self: Arc<Self>) {
        loop {
            let periodic = !matches!(self.reporting.trigger, Some(agent_types::TriggerMode::Manual));
            tokio::select! {
                _ = tokio::time::sleep(self.next_interval()), if periodic => {}
                _ = self.manual_trigger.notified(), if !periodic => {}
                _ = self.cancellation.cancelled() => return,
            }

            loop {
                let chunk = self.buffer.lock().await.drain_chunk(self.reporting.upload_size_limit_bytes);
                if chunk.is_empty() {
                    break;
                }
                if !self.upload_chunk(chunk).await {
                    return; // cancelled mid-retry
                }
            }
        }
    }

    fn next_interval(&self) -> Duration {
        use rand::Rng;
        let min = self.reporting.min_delay;
        let max = self.reporting.max_delay.max(min);
        if max == min {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Upload one chunk, retrying with exponential backoff until it
    /// succeeds or the plugin is stopped (§4.H "counts toward neither
    /// success nor loss until it either succeeds or the plugin is
    /// stopped"). Returns `false` only when cancelled mid-retry.
    async fn upload_chunk(&self, chunk: Vec<DecisionEvent>) -> bool {
        if let Some(console) = &self.console {
            for event in &chunk {
                console.emit(event);
            }
        }

        let Some(client) = &self.client else {
            self.uploaded_total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            return true;
        };

        let body = match gzip_json_array(&chunk) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode decision-log chunk, dropping it");
                return true;
            }
        };

        let retry = agent_retry::RetryStrategyConfig::default();
        let mut attempt = 1u32;
        loop {
            let request = RequestSpec::post(&self.resource, body.clone())
                .with_header("Content-Encoding", "gzip")
                .with_header("Content-Type", "application/json");
            match client.do_request(request).await {
                Ok(_) => {
                    self.uploaded_total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    return true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "decision-log chunk upload failed, retrying");
                    let delay = calculate_delay(&retry, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancellation.cancelled() => return false,
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn gzip_json_array(chunk: &[DecisionEvent]) -> Result<Vec<u8>, DecisionLogError> {
    let json = serde_json::to_vec(chunk).expect("DecisionEvent serialization is infallible");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &json)?;
    Ok(encoder.finish()?)
}

impl Plugin for DecisionLogPlugin {
    fn name(&self) -> &str {
        "decision_logs"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::DecisionLogOrStatus
    }

    fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), PluginError> {
        self.cancellation.cancel();
        Ok(())
    }

    fn reconfigure(&self, _config: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    fn status(&self) -> PluginState {
        PluginState::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_types::Labels;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn event(id: &str) -> DecisionEvent {
        DecisionEvent {
            labels: Labels::default(),
            decision_id: id.to_string(),
            bundles: BTreeMap::new(),
            path: Some("/authz/allow".to_string()),
            query: None,
            input: serde_json::json!({"user": "alice"}),
            result: serde_json::json!(true),
            requested_by: None,
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
            erased: vec![],
            masked: vec![],
            nd_builtin_cache: None,
        }
    }

    #[test]
    fn size_limited_buffer_evicts_oldest_on_overflow() {
        let mut buffer = BufferState::new(Some(&ReportingAdmission::BufferSizeLimitBytes {
            buffer_size_limit_bytes: 1,
        }));
        buffer.admit(event("a"));
        buffer.admit(event("b"));
        let chunk = buffer.drain_chunk(u64::MAX);
        assert_eq!(chunk.len(), 1);
        assert_eq!(chunk[0].decision_id, "b");
    }

    #[test]
    fn rate_limited_buffer_drops_once_tokens_exhausted() {
        let mut buffer = BufferState::new(Some(&ReportingAdmission::MaxDecisionsPerSecond {
            max_decisions_per_second: 1.0,
        }));
        assert!(!buffer.admit(event("a")));
        assert!(buffer.admit(event("b")));
    }

    #[test]
    fn drain_bounded_packs_up_to_the_size_limit() {
        let mut queue = VecDeque::new();
        for i in 0..5 {
            queue.push_back(event(&i.to_string()));
        }
        let chunk = drain_bounded(&mut queue, 64);
        assert!(!chunk.is_empty());
        assert!(chunk.len() < 5);
    }

    #[test]
    fn drain_bounded_always_admits_at_least_one_event() {
        let mut queue = VecDeque::new();
        queue.push_back(event("only"));
        let chunk = drain_bounded(&mut queue, 1);
        assert_eq!(chunk.len(), 1);
    }

    #[test]
    fn oversized_event_has_nd_builtin_cache_stripped() {
        let mut big = event("big");
        big.nd_builtin_cache = Some(serde_json::json!({"blob": "x".repeat(1000)}));
        let mut queue = VecDeque::new();
        queue.push_back(big);
        let chunk = drain_bounded(&mut queue, 64);
        assert_eq!(chunk.len(), 1);
        assert!(chunk[0].nd_builtin_cache.is_none());
    }

    #[tokio::test]
    async fn log_without_console_or_client_still_updates_counters() {
        let plugin = DecisionLogPlugin::new(
            None,
            None,
            &DecisionLogsConfig {
                service: None,
                resource: None,
                reporting: ReportingConfig {
                    admission: None,
                    upload_size_limit_bytes: 32 * 1024,
                    min_delay: Duration::from_secs(60),
                    max_delay: Duration::from_secs(120),
                    trigger: Some(agent_types::TriggerMode::Manual),
                },
                mask_decision: None,
                drop_decision: None,
                plugin: None,
                console: false,
            },
            CancellationToken::new(),
        );

        plugin.log(event("a")).await;
        let chunk = plugin.buffer.lock().await.drain_chunk(u64::MAX);
        assert_eq!(chunk.len(), 1);
    }
}
