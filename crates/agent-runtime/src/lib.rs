//! Embeddable management-plane runtime (§9).
//!
//! Everything upstream of this crate — `agent-bundle`, `agent-discovery`,
//! `agent-decision-log`, `agent-status` — is a narrow, independently
//! testable plugin that talks to the rest of the system only through trait
//! objects. Nothing outside this crate owns a [`Config`], a service client
//! pool, or the [`PluginManager`] itself: [`Runtime`] is the one place
//! those get wired together, replacing what would otherwise be ambient
//! global state with a single object an embedder constructs, starts, and
//! stops.
//!
//! `services`, `labels`, and `keys` are immutable for the life of a
//! `Runtime` (discovery cannot change them, §4.G), so the service client
//! pool, keyring, and bundle verifier are resolved once in [`Runtime::bootstrap`].
//! `bundles`/`bundle`/`decision_logs`/`status` can change across a discovery
//! reconcile, so those plugins are rebuilt by [`Runtime::reconcile`] whenever
//! their section of the effective config changes; `discovery` itself never
//! changes post-boot (it is the thing doing the reconciling) and is built
//! exactly once.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use agent_bundle::{BundlePlugin, BundlePluginError, BundleSource, BundleVerifier, NoopVerifier};
use agent_config::{BundleConfig, Config, SigningConfig};
use agent_decision_log::DecisionLogPlugin;
use agent_discovery::{DiscoveryPlugin, ReconcileFuture, Reconciler};
use agent_downloader::PollConfig;
use agent_http::ServiceClient;
use agent_keystore::Keyring;
use agent_sign::SignatureVerifier;
use agent_state::{Plugin, PluginKind, PluginManager};
use agent_status::{SnapshotSource, StatusPlugin};
use agent_store::{InMemoryStore, Store};
use agent_types::{BundleStatus, Evaluator, Service, TriggerMode};
use agent_webhook::PrometheusSink;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no service named {0:?} is configured")]
    UnknownService(String),

    #[error("service must be named explicitly: more than one service is configured")]
    AmbiguousService,

    #[error("no service is configured")]
    NoServiceConfigured,

    #[error("discovery is configured but no evaluator was supplied")]
    NoEvaluator,

    #[error("failed to resolve service credentials: {0}")]
    Auth(#[from] agent_auth::AuthError),

    #[error("failed to construct service client: {0}")]
    Http(#[from] agent_http::HttpError),

    #[error(transparent)]
    Bundle(#[from] BundlePluginError),

    #[error("failed to start the prometheus sink: {0}")]
    Webhook(#[from] agent_webhook::WebhookError),

    #[error("failed to apply effective configuration: {0}")]
    Reconcile(String),
}

/// Resolve an optional explicit service name against the configured service
/// list, falling back to the sole configured service when none is given —
/// the same "exactly one service means it's the default" latitude real
/// embedders expect when `discovery{}`/`decision_logs{}` omit `service`.
fn resolve_service_name(explicit: Option<&str>, services: &[Service]) -> Result<String, RuntimeError> {
    match explicit {
        Some(name) => Ok(name.to_string()),
        None => match services {
            [only] => Ok(only.name.clone()),
            [] => Err(RuntimeError::NoServiceConfigured),
            _ => Err(RuntimeError::AmbiguousService),
        },
    }
}

/// Resolve a remote client for a plugin that may instead deliver through a
/// named `plugin` implementation or a console-only sink (§4.H "Console
/// fallback"). `Ok(None)` means "no HTTP delivery for this plugin", which is
/// only valid when a custom plugin or console output covers it.
fn resolve_remote_client(
    clients: &BTreeMap<String, Arc<ServiceClient>>,
    explicit_service: Option<&str>,
    services: &[Service],
    plugin: Option<&str>,
    console: bool,
) -> Result<Option<Arc<ServiceClient>>, RuntimeError> {
    if plugin.is_some() {
        return Ok(None);
    }
    match resolve_service_name(explicit_service, services) {
        Ok(name) => clients.get(&name).cloned().map(Some).ok_or(RuntimeError::UnknownService(name)),
        Err(_) if console => Ok(None),
        Err(err) => Err(err),
    }
}

fn build_service_clients(services: &[Service]) -> Result<BTreeMap<String, Arc<ServiceClient>>, RuntimeError> {
    let mut clients = BTreeMap::new();
    for service in services {
        let credential = match &service.credentials {
            Some(value) => agent_auth::resolve(value)?,
            None => agent_auth::CredentialProvider::None,
        };
        let client = ServiceClient::new(service.clone(), credential, agent_retry::RetryStrategyConfig::default())?;
        clients.insert(service.name.clone(), Arc::new(client));
    }
    Ok(clients)
}

/// Fold `bundles{}` and the legacy singular `bundle{}` block into the
/// uniform [`BundleSource`] map the bundle plugin reconciles against. The
/// legacy block's resource path is `<prefix>/<name>` when a prefix is
/// configured, matching how the rest of the bundle API treats `resource` as
/// a plain path suffix under the service's base URL. `agent-config`
/// rejects configs carrying both `bundle` and `bundles` (`ConfigError::LegacyBundleConflict`),
/// so the two loops below never race over the same map key.
fn desired_bundle_sources(
    config: &Config,
    clients: &BTreeMap<String, Arc<ServiceClient>>,
) -> Result<BTreeMap<String, BundleSource>, RuntimeError> {
    let mut desired = BTreeMap::new();

    for (name, bundle_cfg) in &config.bundles {
        let client = clients
            .get(&bundle_cfg.service)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownService(bundle_cfg.service.clone()))?;
        let resource = bundle_cfg.resource.clone().unwrap_or_else(|| name.clone());
        desired.insert(name.clone(), BundleSource { client, resource, config: bundle_cfg.clone() });
    }

    if let Some(legacy) = &config.bundle {
        let client = clients
            .get(&legacy.service)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownService(legacy.service.clone()))?;
        let resource =
            if legacy.prefix.is_empty() { legacy.name.clone() } else { format!("{}/{}", legacy.prefix, legacy.name) };
        desired.insert(
            legacy.name.clone(),
            BundleSource {
                client,
                resource,
                config: BundleConfig {
                    service: legacy.service.clone(),
                    resource: None,
                    polling: legacy.polling.clone(),
                    trigger: None,
                    persist: false,
                    signing: SigningConfig::default(),
                    size_limit_bytes: None,
                },
            },
        );
    }

    Ok(desired)
}

fn poll_config(polling: &agent_config::PollingConfig) -> PollConfig {
    PollConfig { min_delay: polling.min_delay, max_delay: polling.max_delay, long_poll_timeout: polling.long_poll_timeout }
}

/// Owns the service client pool, the plugin manager, and the plugin set
/// (bundle, optional discovery, optional decision-log, optional status),
/// and translates an [`agent_config::Config`] into that plugin set (§9).
pub struct Runtime {
    manager: Arc<PluginManager>,
    store: Arc<dyn Store>,
    clients: BTreeMap<String, Arc<ServiceClient>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    prometheus: Arc<PrometheusSink>,
    persistence_directory: PathBuf,
    bundle: Arc<BundlePlugin>,
    discovery: OnceLock<Arc<DiscoveryPlugin>>,
    decision_log: RwLock<Option<Arc<DecisionLogPlugin>>>,
    status: RwLock<Option<Arc<StatusPlugin>>>,
    active: RwLock<Config>,
    apply_lock: tokio::sync::Mutex<()>,
    cancellation: CancellationToken,
    /// A weak handle to its own `Arc`, set once right after construction, so
    /// `&self` methods can hand out `Arc<dyn Reconciler>`/`Arc<dyn
    /// SnapshotSource>` to children that outlive the call that built them.
    self_ref: OnceLock<Weak<Runtime>>,
}

impl Runtime {
    /// Resolve `config` into a fully wired, started [`Runtime`] (§9). The
    /// returned runtime has already recovered any persisted bundles and
    /// started the plugin manager; callers drive it to completion with
    /// [`Runtime::run`].
    pub async fn bootstrap(
        mut config: Config,
        evaluator: Option<Arc<dyn Evaluator>>,
        persistence_directory: Option<PathBuf>,
    ) -> Result<Arc<Self>, RuntimeError> {
        // `id`/`version` are auto-injected once, here, rather than at config
        // load time (§6 `labels{}`) — `agent-config` has no notion of a
        // running instance's generated id or the runtime's own build
        // version, and discovery must see these as already-present so its
        // immutability rule (§4.G) has something to compare against.
        config.labels = std::mem::take(&mut config.labels)
            .with_auto_injected(&uuid::Uuid::new_v4().to_string(), env!("CARGO_PKG_VERSION"));

        let clients = build_service_clients(&config.services)?;
        let keyring = Keyring::new(config.keys.values().cloned());
        let verifier: Arc<dyn BundleVerifier> =
            if keyring.is_empty() { Arc::new(NoopVerifier) } else { Arc::new(SignatureVerifier::new(keyring)) };

        let persistence_directory = persistence_directory.unwrap_or_else(|| PathBuf::from(config.persistence_dir()));
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let manager = Arc::new(PluginManager::new());
        let prometheus = Arc::new(PrometheusSink::new()?);

        let bundle = BundlePlugin::new(store.clone(), verifier, manager.clone(), persistence_directory.clone());
        manager.register("bundle", PluginKind::Bundle, Arc::downgrade(&bundle) as Weak<dyn Plugin>);

        let runtime = Arc::new(Self {
            manager,
            store,
            clients,
            evaluator,
            prometheus,
            persistence_directory,
            bundle,
            discovery: OnceLock::new(),
            decision_log: RwLock::new(None),
            status: RwLock::new(None),
            active: RwLock::new(Config::default()),
            apply_lock: tokio::sync::Mutex::new(()),
            cancellation: CancellationToken::new(),
            self_ref: OnceLock::new(),
        });
        let _ = runtime.self_ref.set(Arc::downgrade(&runtime));

        runtime.bundle.recover_persisted().await;
        runtime.apply_effective_config(&config).await.map_err(RuntimeError::Reconcile)?;
        runtime.install_discovery(&config).await?;

        runtime.manager.start();
        Ok(runtime)
    }

    fn arc_self(&self) -> Arc<Runtime> {
        self.self_ref.get().expect("self_ref set in bootstrap").upgrade().expect("runtime dropped while in use")
    }

    /// Apply an externally-cancelled token instead of (or in addition to)
    /// [`Runtime::cancel`], e.g. a CLI's `ctrl_c` handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// The document store the embedder's policy evaluator should query
    /// against — the runtime only ever writes to it through bundle
    /// activation, never reads it itself.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Every configured bundle has an active revision, and discovery (if
    /// configured) has completed its first reconcile — the readiness
    /// condition from §7.
    pub fn ready(&self) -> bool {
        let bundles_ready = self.bundle.all_bundles_ready();
        let discovery_ready = self.discovery.get().map(|d| d.status()).is_none_or(|s| s.active_revision.is_some());
        bundles_ready && discovery_ready
    }

    /// The currently effective configuration — the boot config until
    /// discovery's first successful reconcile, its decoded overlay after
    /// (§4.G), always carrying the auto-injected `id`/`version` labels.
    pub fn effective_config(&self) -> Config {
        self.active.read().expect("lock poisoned").clone()
    }

    /// Block until cancelled, then drain the plugin set in reverse
    /// dependency order (§4.J: downloaders → bundle plugin → decision-log/status → discovery).
    pub async fn run(self: Arc<Self>) {
        self.cancellation.cancelled().await;
        self.manager.stop();
        if let Some(discovery) = self.discovery.get() {
            let _ = discovery.stop();
        }
    }

    async fn install_discovery(&self, config: &Config) -> Result<(), RuntimeError> {
        let Some(discovery_cfg) = &config.discovery else { return Ok(()) };
        let evaluator = self.evaluator.clone().ok_or(RuntimeError::NoEvaluator)?;
        let service_name = resolve_service_name(discovery_cfg.service.as_deref(), &config.services)?;
        let client =
            self.clients.get(&service_name).cloned().ok_or_else(|| RuntimeError::UnknownService(service_name))?;

        let discovery = DiscoveryPlugin::new(
            config.clone(),
            client,
            discovery_cfg.resource.clone(),
            discovery_cfg.decision.clone(),
            poll_config(&discovery_cfg.polling),
            discovery_cfg.trigger.unwrap_or(TriggerMode::Periodic),
            evaluator,
            self.arc_self() as Arc<dyn Reconciler>,
            self.persistence_directory.clone(),
            discovery_cfg.persist,
            None,
        );

        self.manager.register("discovery", PluginKind::Discovery, Arc::downgrade(&discovery) as Weak<dyn Plugin>);
        discovery.recover_persisted().await;
        agent_discovery::spawn(discovery.clone());
        let _ = self.discovery.set(discovery);
        Ok(())
    }

    /// Apply the effective configuration (boot config, or discovery's
    /// decoded overlay) to the reconfigurable plugin set. Bundle
    /// reconfiguration always runs — [`BundlePlugin::configure`] diffs
    /// internally and is a no-op when nothing changed; decision-log and
    /// status have no incremental update path, so this method only tears
    /// them down and rebuilds when their section of the config actually
    /// changed, to avoid restarting a healthy uploader on every reconcile.
    async fn apply_effective_config(&self, config: &Config) -> Result<(), String> {
        let _guard = self.apply_lock.lock().await;

        let desired = desired_bundle_sources(config, &self.clients).map_err(|e| e.to_string())?;
        self.bundle.configure(desired).map_err(|e| e.to_string())?;

        let previous = self.active.read().expect("lock poisoned").clone();

        if serde_json::to_value(&previous.decision_logs).ok() != serde_json::to_value(&config.decision_logs).ok() {
            self.replace_decision_log(config).map_err(|e| e.to_string())?;
        }
        if serde_json::to_value(&previous.status).ok() != serde_json::to_value(&config.status).ok() {
            self.replace_status(config).map_err(|e| e.to_string())?;
        }

        *self.active.write().expect("lock poisoned") = config.clone();
        Ok(())
    }

    fn replace_decision_log(&self, config: &Config) -> Result<(), RuntimeError> {
        let mut slot = self.decision_log.write().expect("lock poisoned");
        if let Some(old) = slot.take() {
            let _ = old.stop();
            self.manager.unregister("decision_logs");
        }
        let Some(dl_cfg) = &config.decision_logs else { return Ok(()) };

        let client =
            resolve_remote_client(&self.clients, dl_cfg.service.as_deref(), &config.services, dl_cfg.plugin.as_deref(), dl_cfg.console)?;
        let plugin = DecisionLogPlugin::new(client, self.evaluator.clone(), dl_cfg, CancellationToken::new());
        self.manager.register("decision_logs", PluginKind::DecisionLogOrStatus, Arc::downgrade(&plugin) as Weak<dyn Plugin>);
        tokio::spawn(plugin.clone().run());
        *slot = Some(plugin);
        Ok(())
    }

    fn replace_status(&self, config: &Config) -> Result<(), RuntimeError> {
        let mut slot = self.status.write().expect("lock poisoned");
        if let Some(old) = slot.take() {
            old.cancel();
            self.manager.unregister("status");
        }
        let Some(status_cfg) = &config.status else { return Ok(()) };

        let client = resolve_remote_client(
            &self.clients,
            Some(status_cfg.service.as_str()),
            &config.services,
            status_cfg.plugin.as_deref(),
            status_cfg.console,
        )?;
        let prometheus = status_cfg.prometheus.then(|| self.prometheus.clone());
        let plugin = StatusPlugin::new(
            client,
            config.labels.clone(),
            self.manager.clone(),
            self.arc_self() as Arc<dyn SnapshotSource>,
            prometheus,
            status_cfg,
            CancellationToken::new(),
        );
        self.manager.register("status", PluginKind::DecisionLogOrStatus, Arc::downgrade(&plugin) as Weak<dyn Plugin>);
        plugin.subscribe();
        tokio::spawn(plugin.clone().run());
        *slot = Some(plugin);
        Ok(())
    }
}

impl Reconciler for Runtime {
    fn reconcile<'a>(&'a self, config: &'a Config) -> ReconcileFuture<'a> {
        Box::pin(async move { self.apply_effective_config(config).await })
    }
}

impl SnapshotSource for Runtime {
    fn bundle_statuses(&self) -> BTreeMap<String, BundleStatus> {
        let mut map: BTreeMap<String, BundleStatus> = self
            .bundle
            .bundle_names()
            .into_iter()
            .filter_map(|name| self.bundle.bundle_status(&name).map(|status| (name, status)))
            .collect();
        if let Some(discovery) = self.discovery.get() {
            map.insert("discovery".to_string(), discovery.status());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_config::{BundleConfig, PollingConfig, StatusConfig as CfgStatusConfig};
    use agent_types::Service;
    use std::collections::BTreeMap as Map;
    use std::time::Duration;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            url: "https://127.0.0.1:0".to_string(),
            headers: Map::new(),
            tls: Default::default(),
            response_header_timeout_seconds: None,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_with_no_plugins_configured_starts_and_stops_cleanly() {
        let config = Config { services: vec![service("control-plane")], ..Default::default() };
        let runtime = Runtime::bootstrap(config, None, None).await.unwrap();
        assert!(runtime.ready());
        runtime.cancel();
        runtime.run().await;
    }

    #[tokio::test]
    async fn bootstrap_auto_injects_id_and_version_labels() {
        let config = Config { services: vec![service("control-plane")], ..Default::default() };
        let runtime = Runtime::bootstrap(config, None, None).await.unwrap();
        let labels = runtime.effective_config().labels;
        assert!(labels.get("id").is_some());
        assert_eq!(labels.get("version").map(String::as_str), Some(env!("CARGO_PKG_VERSION")));
        runtime.cancel();
        runtime.run().await;
    }

    #[tokio::test]
    async fn bootstrap_does_not_override_an_explicit_id_label() {
        let mut labels = agent_types::Labels::new();
        labels.insert("id".to_string(), "operator-assigned".to_string());
        let config = Config { services: vec![service("control-plane")], labels, ..Default::default() };
        let runtime = Runtime::bootstrap(config, None, None).await.unwrap();
        assert_eq!(runtime.effective_config().labels.get("id").map(String::as_str), Some("operator-assigned"));
        runtime.cancel();
        runtime.run().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_unknown_bundle_service() {
        let mut bundles = Map::new();
        bundles.insert(
            "main".to_string(),
            BundleConfig {
                service: "missing".to_string(),
                resource: None,
                polling: PollingConfig::default(),
                trigger: None,
                persist: false,
                signing: Default::default(),
                size_limit_bytes: None,
            },
        );
        let config = Config { services: vec![service("control-plane")], bundles, ..Default::default() };
        let err = Runtime::bootstrap(config, None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownService(name) if name == "missing"));
    }

    #[tokio::test]
    async fn bootstrap_wires_console_only_status_without_a_remote_client() {
        let config = Config {
            services: vec![service("control-plane")],
            status: Some(CfgStatusConfig {
                service: "control-plane".to_string(),
                partition_name: None,
                console: true,
                prometheus: false,
                plugin: None,
                trigger: Some(agent_types::TriggerMode::Manual),
            }),
            ..Default::default()
        };
        let runtime = Runtime::bootstrap(config, None, None).await.unwrap();
        assert!(runtime.status.read().unwrap().is_some());
        runtime.cancel();
        runtime.run().await;
    }

    #[test]
    fn resolve_service_name_falls_back_when_exactly_one_configured() {
        let services = vec![service("only")];
        assert_eq!(resolve_service_name(None, &services).unwrap(), "only");
    }

    #[test]
    fn resolve_service_name_is_ambiguous_with_more_than_one() {
        let services = vec![service("a"), service("b")];
        assert!(matches!(resolve_service_name(None, &services), Err(RuntimeError::AmbiguousService)));
    }

    #[test]
    fn desired_bundle_sources_maps_legacy_block_with_prefix() {
        let legacy = agent_config::LegacyBundleConfig {
            name: "authz".to_string(),
            prefix: "bundles".to_string(),
            service: "control-plane".to_string(),
            polling: PollingConfig::default(),
        };
        let config = Config { services: vec![service("control-plane")], bundle: Some(legacy), ..Default::default() };
        let clients = build_service_clients(&config.services).unwrap();
        let desired = desired_bundle_sources(&config, &clients).unwrap();
        assert_eq!(desired["authz"].resource, "bundles/authz");
    }

    #[test]
    fn poll_config_carries_long_poll_timeout_through() {
        let polling = PollingConfig {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            long_poll_timeout: Some(Duration::from_secs(30)),
        };
        let poll = poll_config(&polling);
        assert_eq!(poll.long_poll_timeout, Some(Duration::from_secs(30)));
    }
}
