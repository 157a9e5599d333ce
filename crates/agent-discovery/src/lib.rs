//! Discovery plugin: boot-time reconcile loop (§4.G).
//!
//! The discovery plugin is "a specialized single-bundle downloader whose
//! activation path differs": instead of writing the discovered bundle to
//! the store, it evaluates `data.<discovery.decision>` against the bundle's
//! own modules/data, decodes the result as a configuration object, enforces
//! the immutability rules on `services`/`labels`/`discovery`/`keys`, checks
//! trigger-mode agreement, and hands the resulting effective [`Config`] to a
//! [`Reconciler`] supplied by the runtime (which owns constructing/tearing
//! down the bundle, decision-log, and status plugins).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use agent_config::{Config, ConfigError};
use agent_downloader::{ActivateFuture, Activator, Downloader, PollConfig};
use agent_http::ServiceClient;
use agent_state::{Plugin, PluginError, PluginKind};
use agent_types::{Bundle, BundleStatus, Evaluator, PluginState, TriggerMode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery bundle format error: {0}")]
    Format(#[from] agent_bundle::BundleError),

    #[error("discovery decision evaluation failed: {0}")]
    Eval(#[from] agent_types::EvalError),

    #[error("discovery decision {0:?} is undefined")]
    Undefined(String),

    #[error("failed to decode discovery decision as a configuration object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    TriggerConflict(#[from] ConfigError),

    #[error("reconcile failed: {0}")]
    Reconcile(String),
}

/// A future returned by [`Reconciler::reconcile`], boxed for object-safety.
pub type ReconcileFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Supplied by the runtime: apply the newly computed effective
/// configuration by reconciling the child plugin set (bundles, decision
/// logs, status) via the plugin manager (§4.G "reconciles the child plugin
/// set via the Plugin Manager").
pub trait Reconciler: Send + Sync {
    fn reconcile<'a>(&'a self, config: &'a Config) -> ReconcileFuture<'a>;
}

/// Decode the discovery decision's JSON value into a (partial) [`Config`]
/// overlay, then fold it onto `boot`, enforcing §4.G Immutability:
/// `services`, `labels`, `discovery` itself, and `keys` can never be changed
/// by a discovery bundle. Returns the resulting effective config; a
/// discovered `services` section is dropped but reported back for the
/// caller to log as a configuration error (rather than rejecting the whole
/// activation — "prior services remain").
fn fold_discovered(boot: &Config, decoded: Config) -> (Config, bool) {
    let services_rejected = !decoded.services.is_empty();

    let mut effective = boot.clone();
    effective.bundles = decoded.bundles;
    effective.bundle = decoded.bundle;
    effective.decision_logs = decoded.decision_logs;
    effective.status = decoded.status;
    effective.caching = decoded.caching;
    effective.persistence_directory = decoded.persistence_directory.or_else(|| boot.persistence_directory.clone());
    effective.default_decision = decoded.default_decision.or_else(|| boot.default_decision.clone());
    effective.default_authorization_decision =
        decoded.default_authorization_decision.or(boot.default_authorization_decision.clone());
    effective.nd_builtin_cache = decoded.nd_builtin_cache.or(boot.nd_builtin_cache);
    effective.plugins = decoded.plugins;
    // services/labels/discovery/keys intentionally left as `boot`'s (set by
    // the `effective = boot.clone()` above and never touched again).

    (effective, services_rejected)
}

/// Apply trigger-mode inheritance (§3 Trigger mode, §4.G "Trigger
/// inheritance"): a child declaring no explicit mode inherits
/// `discovery_trigger`; a child declaring the same mode is left alone; any
/// other declaration is a configuration error.
fn reconcile_trigger(
    discovery_trigger: TriggerMode,
    declared: &mut Option<TriggerMode>,
    plugin: &str,
) -> Result<(), ConfigError> {
    match *declared {
        Some(mode) if mode != discovery_trigger => Err(ConfigError::TriggerModeConflict {
            plugin: plugin.to_string(),
            declared: mode,
            discovery: discovery_trigger,
        }),
        Some(_) => Ok(()),
        None => {
            *declared = Some(discovery_trigger);
            Ok(())
        }
    }
}

fn reconcile_all_triggers(effective: &mut Config, discovery_trigger: TriggerMode) -> Result<(), ConfigError> {
    for (name, bundle) in effective.bundles.iter_mut() {
        reconcile_trigger(discovery_trigger, &mut bundle.trigger, &format!("bundle.{name}"))?;
    }
    if let Some(decision_logs) = effective.decision_logs.as_mut() {
        reconcile_trigger(discovery_trigger, &mut decision_logs.reporting.trigger, "decision_logs")?;
    }
    if let Some(status) = effective.status.as_mut() {
        reconcile_trigger(discovery_trigger, &mut status.trigger, "status")?;
    }
    Ok(())
}

/// Single-bundle discovery downloader and boot-time reconcile loop (§4.G).
pub struct DiscoveryPlugin {
    boot: Config,
    decision: String,
    trigger_mode: TriggerMode,
    evaluator: Arc<dyn Evaluator>,
    reconciler: Arc<dyn Reconciler>,
    downloader: Arc<Downloader>,
    cancellation: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    size_limit_bytes: u64,
    persist: bool,
    persistence_directory: PathBuf,
    effective: RwLock<Config>,
    revision: RwLock<Option<String>>,
}

const DEFAULT_DECISION: &str = "discovery";
const DEFAULT_SIZE_LIMIT_BYTES: u64 = agent_bundle::DEFAULT_FILE_SIZE_LIMIT_BYTES;

impl DiscoveryPlugin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        boot: Config,
        client: Arc<ServiceClient>,
        resource: impl Into<String>,
        decision: Option<String>,
        poll: PollConfig,
        trigger_mode: TriggerMode,
        evaluator: Arc<dyn Evaluator>,
        reconciler: Arc<dyn Reconciler>,
        persistence_directory: PathBuf,
        persist: bool,
        size_limit_bytes: Option<u64>,
    ) -> Arc<Self> {
        let cancellation = CancellationToken::new();
        let downloader = Arc::new(Downloader::new(
            "discovery",
            client,
            resource,
            poll,
            trigger_mode,
            cancellation.clone(),
        ));
        Arc::new(Self {
            effective: RwLock::new(boot.clone()),
            boot,
            decision: decision.unwrap_or_else(|| DEFAULT_DECISION.to_string()),
            trigger_mode,
            evaluator,
            reconciler,
            downloader,
            cancellation,
            task: Mutex::new(None),
            size_limit_bytes: size_limit_bytes.unwrap_or(DEFAULT_SIZE_LIMIT_BYTES),
            persist,
            persistence_directory,
            revision: RwLock::new(None),
        })
    }

    pub fn effective_config(&self) -> Config {
        self.effective.read().expect("lock poisoned").clone()
    }

    pub fn status(&self) -> BundleStatus {
        let mut status = self.downloader.status();
        status.active_revision = self.revision.read().expect("lock poisoned").clone();
        status
    }

    pub fn trigger(&self) {
        self.downloader.trigger();
    }

    /// Best-effort recovery from on-disk persistence (§4.F's persistence
    /// convention, reused verbatim for the discovery bundle). Does not count
    /// as a successful download.
    pub async fn recover_persisted(self: &Arc<Self>) {
        if !self.persist {
            return;
        }
        let Some(raw) = agent_bundle::persist::load_persisted_bundle(&self.persistence_directory, "discovery") else {
            return;
        };
        match self.activate(raw, None).await {
            Ok(()) => tracing::info!("recovered discovery bundle from persistence"),
            Err(err) => tracing::warn!(error = %err, "failed to recover persisted discovery bundle"),
        }
    }

    async fn activate(self: &Arc<Self>, raw: Vec<u8>, _etag: Option<&str>) -> Result<(), DiscoveryError> {
        let bundle: Bundle = agent_bundle::read_bundle("discovery", &raw, self.size_limit_bytes)?;

        let query = format!("data.{}", self.decision);
        let decision = self.evaluator.evaluate_bundle(&bundle, &query, serde_json::Value::Object(Default::default())).await?;
        let Some(value) = decision else {
            return Err(DiscoveryError::Undefined(query));
        };

        let decoded: Config = serde_json::from_value(value)?;
        let (mut effective, services_rejected) = fold_discovered(&self.boot, decoded);
        if services_rejected {
            tracing::error!("discovery attempted to modify `services`; prior services remain");
        }

        reconcile_all_triggers(&mut effective, self.trigger_mode)?;

        self.reconciler.reconcile(&effective).await.map_err(DiscoveryError::Reconcile)?;

        *self.effective.write().expect("lock poisoned") = effective;
        *self.revision.write().expect("lock poisoned") = Some(bundle.manifest.revision.clone());

        if self.persist {
            if let Err(err) = agent_bundle::persist::persist_bundle(&self.persistence_directory, "discovery", &raw) {
                tracing::warn!(error = %err, "failed to persist discovery bundle");
            }
        }

        Ok(())
    }
}

struct DiscoveryActivator {
    plugin: Arc<DiscoveryPlugin>,
}

impl Activator for DiscoveryActivator {
    fn activate<'a>(&'a self, body: Vec<u8>, etag: Option<&'a str>) -> ActivateFuture<'a> {
        Box::pin(async move { self.plugin.activate(body, etag).await.map_err(|e| e.to_string()) })
    }
}

impl Plugin for DiscoveryPlugin {
    fn name(&self) -> &str {
        "discovery"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Discovery
    }

    fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), PluginError> {
        self.cancellation.cancel();
        if let Some(handle) = self.task.lock().expect("lock poisoned").take() {
            handle.abort();
        }
        Ok(())
    }

    fn reconfigure(&self, _config: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    fn status(&self) -> PluginState {
        if self.revision.read().expect("lock poisoned").is_some() {
            PluginState::Ok
        } else {
            PluginState::NotReady
        }
    }
}

/// Spawn the discovery downloader's poll loop, bridging its activations
/// through [`DiscoveryPlugin::activate`].
pub fn spawn(plugin: Arc<DiscoveryPlugin>) {
    let activator: Arc<dyn Activator> = Arc::new(DiscoveryActivator { plugin: plugin.clone() });
    let downloader = plugin.downloader.clone();
    let handle = tokio::spawn(async move { downloader.run(activator).await });
    *plugin.task.lock().expect("lock poisoned") = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_config::{BundleConfig, DecisionLogsConfig, PollingConfig, SigningConfig};
    use agent_types::{EvalError, EvalFuture, Labels};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn boot_config() -> Config {
        let mut labels = Labels::new();
        labels.insert("region".to_string(), "US".to_string());
        Config {
            labels,
            ..Default::default()
        }
    }

    #[test]
    fn fold_discovered_keeps_boot_labels_and_services() {
        let boot = boot_config();
        let mut decoded = Config::default();
        decoded.labels.insert("region".to_string(), "UK".to_string());
        decoded.bundles.insert(
            "main".to_string(),
            BundleConfig {
                service: "control-plane".to_string(),
                resource: Some("example/test1/p".to_string()),
                polling: PollingConfig::default(),
                trigger: None,
                persist: false,
                signing: SigningConfig::default(),
                size_limit_bytes: None,
            },
        );

        let (effective, services_rejected) = fold_discovered(&boot, decoded);
        assert!(!services_rejected);
        assert_eq!(effective.labels.get("region"), Some(&"US".to_string()));
        assert!(effective.bundles.contains_key("main"));
    }

    #[test]
    fn fold_discovered_flags_attempted_service_override() {
        let boot = boot_config();
        let mut decoded = Config::default();
        decoded.services.push(agent_types::Service {
            name: "evil".to_string(),
            url: "https://evil.example".to_string(),
            headers: BTreeMap::new(),
            tls: Default::default(),
            response_header_timeout_seconds: None,
            credentials: None,
        });

        let (effective, services_rejected) = fold_discovered(&boot, decoded);
        assert!(services_rejected);
        assert!(effective.services.is_empty());
    }

    #[test]
    fn reconcile_trigger_inherits_when_unset() {
        let mut declared = None;
        reconcile_trigger(TriggerMode::Manual, &mut declared, "bundle.main").unwrap();
        assert_eq!(declared, Some(TriggerMode::Manual));
    }

    #[test]
    fn reconcile_trigger_rejects_disagreement() {
        let mut declared = Some(TriggerMode::Periodic);
        let err = reconcile_trigger(TriggerMode::Manual, &mut declared, "bundle.main").unwrap_err();
        assert!(matches!(err, ConfigError::TriggerModeConflict { .. }));
    }

    #[test]
    fn reconcile_all_triggers_applies_to_decision_logs_and_status() {
        let mut effective = Config {
            decision_logs: Some(DecisionLogsConfig {
                service: None,
                resource: None,
                reporting: Default::default(),
                mask_decision: None,
                drop_decision: None,
                plugin: None,
                console: false,
            }),
            ..Default::default()
        };
        reconcile_all_triggers(&mut effective, TriggerMode::Manual).unwrap();
        assert_eq!(effective.decision_logs.unwrap().reporting.trigger, Some(TriggerMode::Manual));
    }

    struct StaticEvaluator {
        value: serde_json::Value,
        calls: AtomicUsize,
    }

    impl Evaluator for StaticEvaluator {
        fn evaluate<'a>(&'a self, _query: &'a str, _input: serde_json::Value) -> EvalFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let value = self.value.clone();
            Box::pin(async move { Ok(Some(value)) })
        }
    }

    struct UndefinedEvaluator;

    impl Evaluator for UndefinedEvaluator {
        fn evaluate<'a>(&'a self, query: &'a str, _input: serde_json::Value) -> EvalFuture<'a> {
            let query = query.to_string();
            Box::pin(async move { Err(EvalError::Undefined { query }) })
        }
    }

    struct RecordingReconciler {
        seen: Mutex<Vec<Config>>,
    }

    impl Reconciler for RecordingReconciler {
        fn reconcile<'a>(&'a self, config: &'a Config) -> ReconcileFuture<'a> {
            self.seen.lock().unwrap().push(config.clone());
            Box::pin(async { Ok(()) })
        }
    }

    fn discovery_bundle_bytes() -> Vec<u8> {
        use std::io::Write;
        let mut builder = tar::Builder::new(Vec::new());
        let manifest = br#"{"revision":"d1","roots":[""]}"#;
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, ".manifest", &manifest[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    #[tokio::test]
    async fn activate_decodes_decision_and_invokes_reconciler() {
        let boot = boot_config();
        let decision_value = serde_json::json!({
            "bundles": {"main": {"service": "control-plane", "resource": "example/test1/p"}}
        });
        let evaluator: Arc<dyn Evaluator> = Arc::new(StaticEvaluator {
            value: decision_value,
            calls: AtomicUsize::new(0),
        });
        let reconciler = Arc::new(RecordingReconciler { seen: Mutex::new(Vec::new()) });

        let client = test_client();
        let plugin = DiscoveryPlugin::new(
            boot,
            client,
            "discovery/config",
            None,
            PollConfig::default(),
            TriggerMode::Periodic,
            evaluator,
            reconciler.clone(),
            std::env::temp_dir(),
            false,
            None,
        );

        plugin.activate(discovery_bundle_bytes(), None).await.unwrap();

        let seen = reconciler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].bundles.contains_key("main"));
        assert_eq!(plugin.revision.read().unwrap().as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn activate_rejects_undefined_decision() {
        let boot = boot_config();
        let evaluator: Arc<dyn Evaluator> = Arc::new(UndefinedEvaluator);
        let reconciler = Arc::new(RecordingReconciler { seen: Mutex::new(Vec::new()) });
        let client = test_client();
        let plugin = DiscoveryPlugin::new(
            boot,
            client,
            "discovery/config",
            None,
            PollConfig::default(),
            TriggerMode::Periodic,
            evaluator,
            reconciler,
            std::env::temp_dir(),
            false,
            None,
        );

        let err = plugin.activate(discovery_bundle_bytes(), None).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Undefined(_)));
    }

    fn test_client() -> Arc<ServiceClient> {
        let service = agent_types::Service {
            name: "control-plane".to_string(),
            url: "https://127.0.0.1:0".to_string(),
            headers: BTreeMap::new(),
            tls: Default::default(),
            response_header_timeout_seconds: None,
            credentials: None,
        };
        Arc::new(
            ServiceClient::new(service, agent_auth::CredentialProvider::Bearer { token: "t".to_string() }, agent_retry::RetryStrategyConfig::default())
                .unwrap(),
        )
    }
}
