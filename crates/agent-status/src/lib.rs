//! Status plugin: aggregated health snapshots on state transitions (§4.I).
//!
//! Subscribes to every [`agent_state::PluginManager`] status transition
//! (which already fires on bundle/discovery activation, since those update
//! the manager's per-plugin status as part of activating or rejecting a
//! candidate). On each transition it rebuilds a full [`StatusSnapshot`] and
//! enqueues it; unlike the decision-log buffer, the queue holds exactly one
//! snapshot — newest wins (§4.I). Upload cadence and retry mirror
//! `agent-decision-log`'s uploader loop exactly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_config::StatusConfig;
use agent_http::{RequestSpec, ServiceClient};
use agent_retry::calculate_delay;
use agent_state::{Plugin, PluginError, PluginKind, PluginManager, StatusListener};
use agent_types::{BundleStatus, Labels, PluginState, PluginStatus, StatusSnapshot, TriggerMode};
use agent_webhook::{ConsoleSink, PrometheusSink};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to encode status snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Default periodic cadence, since §6's `status{}` config block (unlike
/// `decision_logs.reporting`) exposes no `min_delay`/`max_delay` knobs —
/// the status plugin always uses the same jittered window `agent-config`
/// defaults `polling`/`reporting` delays to.
const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);

/// Supplied by the runtime: the current per-bundle health the status
/// snapshot should report (§3 Status snapshot "per-bundle"). Kept as a
/// trait object so this crate does not need a dependency on `agent-bundle`
/// or `agent-discovery` just to read their status.
pub trait SnapshotSource: Send + Sync {
    fn bundle_statuses(&self) -> BTreeMap<String, BundleStatus>;
}

/// The status pipeline for one configured `status` block (§4.I).
pub struct StatusPlugin {
    client: Option<Arc<ServiceClient>>,
    resource: String,
    labels: Labels,
    manager: Arc<PluginManager>,
    source: Arc<dyn SnapshotSource>,
    console: Option<ConsoleSink>,
    prometheus: Option<Arc<PrometheusSink>>,
    trigger_mode: TriggerMode,
    queue: Mutex<Option<StatusSnapshot>>,
    manual_trigger: Notify,
    cancellation: CancellationToken,
    uploaded_total: AtomicU64,
}

impl StatusPlugin {
    pub fn new(
        client: Option<Arc<ServiceClient>>,
        labels: Labels,
        manager: Arc<PluginManager>,
        source: Arc<dyn SnapshotSource>,
        prometheus: Option<Arc<PrometheusSink>>,
        config: &StatusConfig,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        let mut resource = "status".to_string();
        if let Some(partition) = &config.partition_name {
            resource = format!("{resource}/{partition}");
        }
        Arc::new(Self {
            client,
            resource,
            labels,
            manager,
            source,
            console: config.console.then(|| ConsoleSink::new("status")),
            prometheus: config.prometheus.then_some(prometheus).flatten(),
            trigger_mode: config.trigger.unwrap_or(TriggerMode::Periodic),
            queue: Mutex::new(None),
            manual_trigger: Notify::new(),
            cancellation,
            uploaded_total: AtomicU64::new(0),
        })
    }

    pub fn trigger(&self) {
        self.manual_trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn uploaded_total(&self) -> u64 {
        self.uploaded_total.load(Ordering::Relaxed)
    }

    /// Subscribe this plugin to plugin-manager status transitions. Separate
    /// from `new` because it needs an `Arc` to hand out a weak reference.
    pub fn subscribe(self: &Arc<Self>) {
        let listener: std::sync::Weak<dyn StatusListener> = Arc::downgrade(self) as _;
        self.manager.subscribe(listener);
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let bundles = self.source.bundle_statuses();
        let plugins = self
            .manager
            .statuses()
            .into_iter()
            .map(|(name, state)| (name, PluginStatus { state }))
            .collect();
        StatusSnapshot {
            labels: self.labels.clone(),
            bundles,
            plugins,
            metrics: BTreeMap::new(),
        }
    }

    /// Rebuild the snapshot and replace whatever is currently queued —
    /// "the queue holds exactly one snapshot (newest wins)" (§4.I).
    fn enqueue_latest(&self) {
        let snapshot = self.build_snapshot();
        if let Ok(mut queue) = self.queue.try_lock() {
            *queue = Some(snapshot);
        } else {
            // The uploader is mid-drain; spin onto a blocking lock instead
            // of dropping this transition's snapshot.
            let handle = tokio::runtime::Handle::try_current();
            if let Ok(handle) = handle {
                let queue = self.queue_for_async();
                handle.spawn(async move {
                    *queue.lock().await = Some(snapshot);
                });
            }
        }
    }

    fn queue_for_async(&self) -> &Mutex<Option<StatusSnapshot>> {
        &self.queue
    }

    /// Uploader loop: jittered periodic wakeups or manual triggers, same
    /// shape as `agent_decision_log::DecisionLogPlugin::run`, draining the
    /// single-slot queue instead of a multi-event buffer.
    pub async fn run(self: Arc<Self>) {
        loop {
            let periodic = !matches!(self.trigger_mode, TriggerMode::Manual);
            tokio::select! {
                _ = tokio::time::sleep(next_interval()), if periodic => {}
                _ = self.manual_trigger.notified(), if !periodic => {}
                _ = self.cancellation.cancelled() => return,
            }

            let snapshot = self.queue.lock().await.take();
            let Some(snapshot) = snapshot else { continue };
            if !self.upload_snapshot(&snapshot).await {
                return; // cancelled mid-retry
            }
        }
    }

    async fn upload_snapshot(&self, snapshot: &StatusSnapshot) -> bool {
        if let Some(console) = &self.console {
            console.emit(snapshot);
        }
        if let Some(prometheus) = &self.prometheus {
            prometheus.record_status_snapshot(snapshot);
        }

        let Some(client) = &self.client else {
            self.uploaded_total.fetch_add(1, Ordering::Relaxed);
            return true;
        };

        let body = match serde_json::to_vec(snapshot) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode status snapshot, dropping it");
                return true;
            }
        };

        let retry = agent_retry::RetryStrategyConfig::default();
        let mut attempt = 1u32;
        loop {
            let request = RequestSpec::post(&self.resource, body.clone()).with_header("Content-Type", "application/json");
            match client.do_request(request).await {
                Ok(_) => {
                    self.uploaded_total.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "status snapshot upload failed, retrying");
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

fn next_interval() -> Duration {
    use rand::Rng;
    let (min, max) = (DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY);
    let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

impl StatusListener for StatusPlugin {
    fn on_status_change(&self, _plugin: &str, _state: PluginState) {
        self.enqueue_latest();
    }
}

impl Plugin for StatusPlugin {
    fn name(&self) -> &str {
        "status"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::DecisionLogOrStatus
    }

    fn start(&self) -> Result<(), PluginError> {
        self.enqueue_latest();
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
