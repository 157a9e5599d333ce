//! Bundle plugin: multi-bundle downloader orchestration, serialized
//! activation, and persistence recovery (§4.F).

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use agent_config::{BundleConfig, SigningConfig};
use agent_downloader::{ActivateFuture, Activator, Downloader, PollConfig};
use agent_http::ServiceClient;
use agent_state::{Plugin, PluginError, PluginKind, PluginManager};
use agent_store::{BundleActivation, Store, StoreError, Transaction};
use agent_types::{Bundle, BundleStatus, TriggerMode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::format::{self, BundleError as FormatError, DEFAULT_FILE_SIZE_LIMIT_BYTES};
use crate::persist;

#[derive(Debug, Error)]
pub enum BundlePluginError {
    #[error("no service named {0:?} is configured for bundle {1:?}")]
    UnknownService(String, String),

    #[error("bundle format error: {0}")]
    Format(#[from] FormatError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("signature verification failed: {0}")]
    Verification(String),
}

/// A future returned by [`BundleVerifier::verify`], boxed for object-safety.
pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Signature verification hook, implemented by `agent-sign` (§4.C). Kept as
/// a trait here rather than a direct dependency so `agent-bundle` does not
/// depend on the crate that depends on it for canonicalization reuse.
pub trait BundleVerifier: Send + Sync {
    fn verify<'a>(&'a self, bundle: &'a Bundle, signing: &'a SigningConfig) -> VerifyFuture<'a>;
}

/// A verifier that accepts every bundle unconditionally, used when a bundle
/// has no `signing` configuration or in tests.
pub struct NoopVerifier;

impl BundleVerifier for NoopVerifier {
    fn verify<'a>(&'a self, _bundle: &'a Bundle, _signing: &'a SigningConfig) -> VerifyFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// One configured bundle's resolved dependencies, handed in at construction
/// or reconfiguration time by the runtime (which owns the services map and
/// credential resolution).
#[derive(Clone)]
pub struct BundleSource {
    pub client: Arc<ServiceClient>,
    pub resource: String,
    pub config: BundleConfig,
}

struct Entry {
    name: String,
    downloader: Arc<Downloader>,
    cancellation: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    signing: SigningConfig,
    size_limit_bytes: u64,
    persist: bool,
}

/// Each bundle's downloader is independently registered with the plugin
/// manager under `PluginKind::Downloader` (§4.J "downloaders -> bundle
/// plugin -> ..." shutdown order), distinct from the `BundlePlugin` itself
/// which registers as `PluginKind::Bundle`.
impl Plugin for Entry {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Downloader
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

    fn status(&self) -> agent_types::PluginState {
        if self.downloader.status().active_revision.is_some() {
            agent_types::PluginState::Ok
        } else {
            agent_types::PluginState::NotReady
        }
    }
}

/// Owns a map `name -> downloader + latest state` and serializes activation
/// across all of them through a single apply queue (§4.F).
pub struct BundlePlugin {
    store: Arc<dyn Store>,
    verifier: Arc<dyn BundleVerifier>,
    manager: Arc<PluginManager>,
    persistence_directory: PathBuf,
    entries: RwLock<BTreeMap<String, Arc<Entry>>>,
    apply_lock: tokio::sync::Mutex<()>,
    revisions: RwLock<BTreeMap<String, String>>,
}

impl BundlePlugin {
    pub fn new(
        store: Arc<dyn Store>,
        verifier: Arc<dyn BundleVerifier>,
        manager: Arc<PluginManager>,
        persistence_directory: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            verifier,
            manager,
            persistence_directory,
            entries: RwLock::new(BTreeMap::new()),
            apply_lock: tokio::sync::Mutex::new(()),
            revisions: RwLock::new(BTreeMap::new()),
        })
    }

    /// Reconcile the desired bundle set against what is currently running:
    /// added names get new downloaders, removed names are stopped and their
    /// roots erased, changed names are replaced without a gap in activation
    /// (§4.F "Reconfiguration").
    pub fn configure(self: &Arc<Self>, desired: BTreeMap<String, BundleSource>) -> Result<(), BundlePluginError> {
        let mut entries = self.entries.write().expect("lock poisoned");

        let removed: Vec<String> = entries.keys().filter(|name| !desired.contains_key(*name)).cloned().collect();
        for name in &removed {
            if let Some(entry) = entries.remove(name) {
                self.stop_entry(name, &entry);
                self.erase_bundle(name);
            }
        }

        for (name, source) in desired {
            let is_new = !entries.contains_key(&name);
            let changed = entries
                .get(&name)
                .map(|existing| {
                    serde_json::to_value(&existing.signing).ok() != serde_json::to_value(&source.config.signing).ok()
                        || existing.size_limit_bytes != source.config.size_limit_bytes.unwrap_or(DEFAULT_FILE_SIZE_LIMIT_BYTES)
                })
                .unwrap_or(false);

            if is_new || changed {
                if let Some(old) = entries.remove(&name) {
                    self.stop_entry(&name, &old);
                }
                let entry = self.build_entry(&name, &source);
                self.start_entry(&name, &entry);
                entries.insert(name, entry);
            }
        }

        Ok(())
    }

    fn build_entry(self: &Arc<Self>, name: &str, source: &BundleSource) -> Arc<Entry> {
        let poll = PollConfig {
            min_delay: source.config.polling.min_delay,
            max_delay: source.config.polling.max_delay,
            long_poll_timeout: source.config.polling.long_poll_timeout,
        };
        let cancellation = CancellationToken::new();
        let downloader = Arc::new(Downloader::new(
            name,
            source.client.clone(),
            source.resource.clone(),
            poll,
            source.config.trigger.unwrap_or(TriggerMode::Periodic),
            cancellation.clone(),
        ));
        Arc::new(Entry {
            name: name.to_string(),
            downloader,
            cancellation,
            task: Mutex::new(None),
            signing: source.config.signing.clone(),
            size_limit_bytes: source.config.size_limit_bytes.unwrap_or(DEFAULT_FILE_SIZE_LIMIT_BYTES),
            persist: source.config.persist,
        })
    }

    fn start_entry(self: &Arc<Self>, name: &str, entry: &Arc<Entry>) {
        self.manager.register(
            format!("downloader.{name}"),
            PluginKind::Downloader,
            Arc::downgrade(entry) as std::sync::Weak<dyn Plugin>,
        );
        let activator: Arc<dyn Activator> = Arc::new(BundleActivator {
            name: name.to_string(),
            plugin: self.clone(),
            entry: entry.clone(),
        });
        let downloader = entry.downloader.clone();
        let handle = tokio::spawn(async move { downloader.run(activator).await });
        *entry.task.lock().expect("lock poisoned") = Some(handle);
    }

    fn stop_entry(&self, name: &str, entry: &Entry) {
        entry.cancellation.cancel();
        if let Some(handle) = entry.task.lock().expect("lock poisoned").take() {
            handle.abort();
        }
        self.manager.unregister(&format!("downloader.{name}"));
    }

    /// Erase a removed bundle's footprint by reactivating it with an empty
    /// root set, which the store's apply algorithm erases under the prior
    /// roots and replaces with nothing (§4.F "removed names have their
    /// downloaders stopped and their owned roots erased").
    fn erase_bundle(&self, name: &str) {
        let txn = Transaction::new().activate(BundleActivation {
            name: name.to_string(),
            roots: Vec::new(),
            data: serde_json::Value::Null,
            modules: Vec::new(),
        });
        if let Err(err) = self.store.apply(txn) {
            tracing::warn!(bundle = %name, error = %err, "failed to erase removed bundle's footprint");
        }
        self.revisions.write().expect("lock poisoned").remove(name);
    }

    /// Best-effort recovery of persisted bundles (§4.F "On start"). Does not
    /// count toward `last_successful_download`.
    pub async fn recover_persisted(self: &Arc<Self>) {
        let names: Vec<(String, Arc<Entry>)> = {
            let entries = self.entries.read().expect("lock poisoned");
            entries
                .iter()
                .filter(|(_, e)| e.persist)
                .map(|(n, e)| (n.clone(), e.clone()))
                .collect()
        };

        for (name, entry) in names {
            let Some(raw) = persist::load_persisted_bundle(&self.persistence_directory, &name) else {
                continue;
            };
            match self.activate(&name, &entry, raw).await {
                Ok(()) => {
                    tracing::info!(bundle = %name, "recovered bundle from persistence");
                    self.manager.update_plugin_status(&format!("bundle.{name}"), agent_types::PluginState::Ok);
                }
                Err(err) => {
                    tracing::warn!(bundle = %name, error = %err, "failed to recover persisted bundle");
                }
            }
        }
    }

    /// Parse, verify, and activate a downloaded candidate, serialized
    /// against every other bundle in this plugin instance (§4.F
    /// "Activation is serialized").
    async fn activate(self: &Arc<Self>, name: &str, entry: &Entry, raw: Vec<u8>) -> Result<(), BundlePluginError> {
        let _guard = self.apply_lock.lock().await;

        let bundle = format::read_bundle(name, &raw, entry.size_limit_bytes)?;
        self.verifier
            .verify(&bundle, &entry.signing)
            .await
            .map_err(BundlePluginError::Verification)?;

        let txn = Transaction::new().activate(BundleActivation {
            name: name.to_string(),
            roots: bundle.roots(),
            data: bundle.data.clone(),
            modules: bundle.modules.clone(),
        });
        self.store.apply(txn)?;

        self.revisions
            .write()
            .expect("lock poisoned")
            .insert(name.to_string(), bundle.manifest.revision.clone());

        if entry.persist {
            if let Err(err) = persist::persist_bundle(&self.persistence_directory, name, &raw) {
                tracing::warn!(bundle = %name, error = %err, "failed to persist bundle");
            }
        }

        Ok(())
    }

    /// Combined per-bundle status (§3 Status snapshot), merging the
    /// downloader's request/download timestamps with the activation
    /// history this plugin tracks.
    pub fn bundle_status(&self, name: &str) -> Option<BundleStatus> {
        let entries = self.entries.read().expect("lock poisoned");
        let entry = entries.get(name)?;
        let mut status = entry.downloader.status();
        status.active_revision = self.revisions.read().expect("lock poisoned").get(name).cloned();
        Some(status)
    }

    pub fn bundle_names(&self) -> Vec<String> {
        self.entries.read().expect("lock poisoned").keys().cloned().collect()
    }

    /// Every configured bundle has at least one active revision: the
    /// health-readiness condition from §7.
    pub fn all_bundles_ready(&self) -> bool {
        let entries = self.entries.read().expect("lock poisoned");
        let revisions = self.revisions.read().expect("lock poisoned");
        entries.keys().all(|name| revisions.contains_key(name))
    }
}

struct BundleActivator {
    name: String,
    plugin: Arc<BundlePlugin>,
    entry: Arc<Entry>,
}

impl Activator for BundleActivator {
    fn activate<'a>(&'a self, body: Vec<u8>, _etag: Option<&'a str>) -> ActivateFuture<'a> {
        Box::pin(async move {
            match self.plugin.activate(&self.name, &self.entry, body).await {
                Ok(()) => {
                    self.plugin
                        .manager
                        .update_plugin_status(&format!("bundle.{}", self.name), agent_types::PluginState::Ok);
                    Ok(())
                }
                Err(err) => {
                    self.plugin
                        .manager
                        .update_plugin_status(&format!("bundle.{}", self.name), agent_types::PluginState::Err);
                    Err(err.to_string())
                }
            }
        })
    }
}

impl Plugin for BundlePlugin {
    fn name(&self) -> &str {
        "bundle"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Bundle
    }

    fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), PluginError> {
        let entries = self.entries.read().expect("lock poisoned");
        for (name, entry) in entries.iter() {
            self.stop_entry(name, entry);
        }
        Ok(())
    }

    fn reconfigure(&self, _config: &serde_json::Value) -> Result<(), PluginError> {
        // Reconfiguration goes through `BundlePlugin::configure` directly
        // (it needs resolved `ServiceClient`s the generic `Plugin` trait
        // object boundary cannot carry); the discovery plugin calls that
        // method on its `Arc<BundlePlugin>` handle rather than through this
        // trait method.
        Ok(())
    }

    fn status(&self) -> agent_types::PluginState {
        if self.all_bundles_ready() {
            agent_types::PluginState::Ok
        } else {
            agent_types::PluginState::NotReady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_auth::CredentialProvider;
    use agent_config::PollingConfig;
    use agent_retry::RetryStrategyConfig;
    use agent_store::InMemoryStore;
    use agent_types::{Service, TlsConfig};
    use std::time::Duration;

    fn client() -> Arc<ServiceClient> {
        let service = Service {
            name: "registry".to_string(),
            url: "http://127.0.0.1:1".to_string(),
            headers: Default::default(),
            tls: TlsConfig::default(),
            response_header_timeout_seconds: None,
            credentials: None,
        };
        Arc::new(
            ServiceClient::new(service, CredentialProvider::Bearer { token: "t".into() }, RetryStrategyConfig::default())
                .unwrap(),
        )
    }

    fn test_plugin() -> Arc<BundlePlugin> {
        let store = Arc::new(InMemoryStore::new());
        let manager = Arc::new(PluginManager::new());
        BundlePlugin::new(store, Arc::new(NoopVerifier), manager, std::env::temp_dir())
    }

    fn test_bundle_bytes(revision: &str, roots: &[&str]) -> Vec<u8> {
        let manifest = serde_json::json!({"revision": revision, "roots": roots});
        let bundle = Bundle {
            name: "main".to_string(),
            manifest: serde_json::from_value(manifest).unwrap(),
            modules: vec![],
            data: serde_json::json!({}),
            wasm: vec![],
            signatures: None,
            raw_files: BTreeMap::new(),
        };
        format::write_bundle(&bundle).unwrap()
    }

    #[tokio::test]
    async fn activate_writes_through_to_the_store_and_records_revision() {
        let plugin = test_plugin();
        let source = BundleSource {
            client: client(),
            resource: "bundles/main".to_string(),
            config: BundleConfig {
                service: "registry".to_string(),
                resource: None,
                polling: PollingConfig::default(),
                trigger: Some(TriggerMode::Manual),
                persist: false,
                signing: SigningConfig::default(),
                size_limit_bytes: None,
            },
        };
        plugin.configure(BTreeMap::from([("main".to_string(), source)])).unwrap();

        let entry = plugin.entries.read().unwrap().get("main").unwrap().clone();
        plugin.activate("main", &entry, test_bundle_bytes("v1", &["authz"])).await.unwrap();

        assert_eq!(plugin.bundle_status("main").unwrap().active_revision, Some("v1".to_string()));
        assert!(plugin.all_bundles_ready());
    }

    #[tokio::test]
    async fn activate_rejects_overlapping_roots_without_touching_incumbent() {
        let plugin = test_plugin();
        let main_source = BundleSource {
            client: client(),
            resource: "bundles/main".to_string(),
            config: BundleConfig {
                service: "registry".to_string(),
                resource: None,
                polling: PollingConfig::default(),
                trigger: Some(TriggerMode::Manual),
                persist: false,
                signing: SigningConfig::default(),
                size_limit_bytes: None,
            },
        };
        let other_source = BundleSource {
            client: client(),
            resource: "bundles/other".to_string(),
            config: main_source.config.clone(),
        };
        plugin
            .configure(BTreeMap::from([
                ("main".to_string(), main_source),
                ("other".to_string(), other_source),
            ]))
            .unwrap();

        let entries = plugin.entries.read().unwrap().clone();
        plugin
            .activate("main", entries.get("main").unwrap(), test_bundle_bytes("v1", &["a/b"]))
            .await
            .unwrap();

        let err = plugin
            .activate("other", entries.get("other").unwrap(), test_bundle_bytes("v1", &["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BundlePluginError::Store(StoreError::RootOverlap { .. })));
        assert_eq!(plugin.bundle_status("main").unwrap().active_revision, Some("v1".to_string()));
        assert!(plugin.bundle_status("other").unwrap().active_revision.is_none());
    }
}
