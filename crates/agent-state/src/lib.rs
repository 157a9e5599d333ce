//! Plugin registry and lifecycle manager (§4.J Plugin Manager).
//!
//! The manager owns the registry `name -> Plugin`, start/stop/reconfigure
//! orchestration, and the status fan-out that the Status Plugin subscribes
//! to. Per §3 "Ownership rules", each plugin exclusively owns its own state
//! and tasks; the manager only holds [`Weak`] references for lookup and
//! coordination, never keeping a plugin alive past its owner's lifetime.

use std::collections::BTreeMap;
use std::sync::{RwLock, Weak};

use agent_types::PluginState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no plugin registered under name {0:?}")]
    UnknownPlugin(String),

    #[error("plugin {0:?} has already been dropped by its owner")]
    Dropped(String),

    #[error("plugin {name:?} failed: {detail}")]
    Plugin { name: String, detail: String },
}

/// Which stage of the shutdown order a plugin belongs to (§4.J "Stop drains
/// in reverse dependency order: downloaders -> bundle plugin ->
/// decision-log/status -> discovery").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginKind {
    Downloader,
    Bundle,
    DecisionLogOrStatus,
    Discovery,
}

impl PluginKind {
    /// Stop order, ascending: downloaders first, discovery last.
    fn stop_rank(self) -> u8 {
        match self {
            PluginKind::Downloader => 0,
            PluginKind::Bundle => 1,
            PluginKind::DecisionLogOrStatus => 2,
            PluginKind::Discovery => 3,
        }
    }

    /// Start order is the reverse: discovery computes the desired child set
    /// before its children can be brought up.
    fn start_rank(self) -> u8 {
        3 - self.stop_rank()
    }
}

/// A managed unit of work: a downloader, the bundle plugin, discovery, a
/// decision-log pipeline, or the status plugin.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> PluginKind;
    fn start(&self) -> Result<(), PluginError>;
    fn stop(&self) -> Result<(), PluginError>;
    fn reconfigure(&self, config: &serde_json::Value) -> Result<(), PluginError>;
    fn status(&self) -> PluginState;
}

/// Receives status fan-out whenever [`PluginManager::update_plugin_status`]
/// is called.
pub trait StatusListener: Send + Sync {
    fn on_status_change(&self, plugin: &str, state: PluginState);
}

struct Entry {
    kind: PluginKind,
    plugin: Weak<dyn Plugin>,
}

/// Registry, lifecycle orchestration, and status fan-out for every plugin in
/// the running agent (§4.J).
#[derive(Default)]
pub struct PluginManager {
    entries: RwLock<BTreeMap<String, Entry>>,
    statuses: RwLock<BTreeMap<String, PluginState>>,
    listeners: RwLock<Vec<Weak<dyn StatusListener>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Register(name, factory)`: records a weak handle to an
    /// already-constructed plugin, owned by its caller.
    pub fn register(&self, name: impl Into<String>, kind: PluginKind, plugin: Weak<dyn Plugin>) {
        let name = name.into();
        self.entries.write().expect("lock poisoned").insert(name.clone(), Entry { kind, plugin });
        self.statuses
            .write()
            .expect("lock poisoned")
            .entry(name)
            .or_insert(PluginState::NotReady);
    }

    pub fn unregister(&self, name: &str) {
        self.entries.write().expect("lock poisoned").remove(name);
        self.statuses.write().expect("lock poisoned").remove(name);
    }

    /// `Start()`: brings every registered plugin up in dependency order
    /// (discovery first, downloaders last).
    pub fn start(&self) -> Result<(), PluginError> {
        self.for_each_in_order(|e| e.kind.start_rank(), |plugin| plugin.start())
    }

    /// `Stop()`: drains in reverse dependency order (§4.J).
    pub fn stop(&self) -> Result<(), PluginError> {
        self.for_each_in_order(|e| e.kind.stop_rank(), |plugin| plugin.stop())
    }

    fn for_each_in_order(
        &self,
        rank_of: impl Fn(&Entry) -> u8,
        action: impl Fn(&dyn Plugin) -> Result<(), PluginError>,
    ) -> Result<(), PluginError> {
        let entries = self.entries.read().expect("lock poisoned");
        let mut ordered: Vec<(&String, &Entry)> = entries.iter().collect();
        ordered.sort_by_key(|(_, e)| rank_of(e));

        for (name, entry) in ordered {
            match entry.plugin.upgrade() {
                Some(plugin) => action(plugin.as_ref()).map_err(|_| PluginError::Plugin {
                    name: name.clone(),
                    detail: "lifecycle action failed".to_string(),
                })?,
                None => {
                    tracing::warn!(plugin = %name, "skipping dropped plugin during lifecycle action");
                }
            }
        }
        Ok(())
    }

    /// `Reconfigure(new_cfg)`: pushes a new configuration fragment to one
    /// named plugin.
    pub fn reconfigure(&self, name: &str, config: &serde_json::Value) -> Result<(), PluginError> {
        let entries = self.entries.read().expect("lock poisoned");
        let entry = entries.get(name).ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
        let plugin = entry.plugin.upgrade().ok_or_else(|| PluginError::Dropped(name.to_string()))?;
        plugin.reconfigure(config)
    }

    /// `UpdatePluginStatus(name, state)`: records the new state and fans it
    /// out to every still-live subscriber.
    pub fn update_plugin_status(&self, name: &str, state: PluginState) {
        self.statuses.write().expect("lock poisoned").insert(name.to_string(), state);

        let listeners = self.listeners.read().expect("lock poisoned");
        for listener in listeners.iter() {
            if let Some(listener) = listener.upgrade() {
                listener.on_status_change(name, state);
            }
        }
    }

    pub fn status(&self, name: &str) -> Option<PluginState> {
        self.statuses.read().expect("lock poisoned").get(name).copied()
    }

    pub fn statuses(&self) -> BTreeMap<String, PluginState> {
        self.statuses.read().expect("lock poisoned").clone()
    }

    /// `Subscribe(listener)`: registers a weak listener for status fan-out.
    pub fn subscribe(&self, listener: Weak<dyn StatusListener>) {
        self.listeners.write().expect("lock poisoned").push(listener);
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.entries.read().expect("lock poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingPlugin {
        name: String,
        kind: PluginKind,
        log: Arc<Mutex<Vec<String>>>,
        state: Mutex<PluginState>,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> PluginKind {
            self.kind
        }

        fn start(&self) -> Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            *self.state.lock().unwrap() = PluginState::Ok;
            Ok(())
        }

        fn stop(&self) -> Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }

        fn reconfigure(&self, _config: &serde_json::Value) -> Result<(), PluginError> {
            Ok(())
        }

        fn status(&self) -> PluginState {
            *self.state.lock().unwrap()
        }
    }

    fn plugin(log: &Arc<Mutex<Vec<String>>>, name: &str, kind: PluginKind) -> Arc<RecordingPlugin> {
        Arc::new(RecordingPlugin {
            name: name.to_string(),
            kind,
            log: log.clone(),
            state: Mutex::new(PluginState::NotReady),
        })
    }

    #[test]
    fn stop_drains_in_reverse_dependency_order() {
        let manager = PluginManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let discovery = plugin(&log, "discovery", PluginKind::Discovery);
        let status = plugin(&log, "status", PluginKind::DecisionLogOrStatus);
        let bundle = plugin(&log, "bundle", PluginKind::Bundle);
        let downloader = plugin(&log, "downloader.main", PluginKind::Downloader);

        manager.register("discovery", PluginKind::Discovery, Arc::downgrade(&discovery) as Weak<dyn Plugin>);
        manager.register("status", PluginKind::DecisionLogOrStatus, Arc::downgrade(&status) as Weak<dyn Plugin>);
        manager.register("bundle", PluginKind::Bundle, Arc::downgrade(&bundle) as Weak<dyn Plugin>);
        manager.register(
            "downloader.main",
            PluginKind::Downloader,
            Arc::downgrade(&downloader) as Weak<dyn Plugin>,
        );

        manager.stop().expect("stop");

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["stop:downloader.main", "stop:bundle", "stop:status", "stop:discovery"]
        );
    }

    #[test]
    fn start_brings_discovery_up_before_downloaders() {
        let manager = PluginManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let discovery = plugin(&log, "discovery", PluginKind::Discovery);
        let downloader = plugin(&log, "downloader.main", PluginKind::Downloader);

        manager.register(
            "downloader.main",
            PluginKind::Downloader,
            Arc::downgrade(&downloader) as Weak<dyn Plugin>,
        );
        manager.register("discovery", PluginKind::Discovery, Arc::downgrade(&discovery) as Weak<dyn Plugin>);

        manager.start().expect("start");

        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec!["start:discovery", "start:downloader.main"]);
    }

    #[test]
    fn dropped_plugin_is_skipped_not_errored() {
        let manager = PluginManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let downloader = plugin(&log, "downloader.main", PluginKind::Downloader);
        manager.register(
            "downloader.main",
            PluginKind::Downloader,
            Arc::downgrade(&downloader) as Weak<dyn Plugin>,
        );
        drop(downloader);

        assert!(manager.stop().is_ok());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn reconfigure_unknown_plugin_errors() {
        let manager = PluginManager::new();
        let err = manager.reconfigure("missing", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PluginError::UnknownPlugin(name) if name == "missing"));
    }

    #[test]
    fn update_plugin_status_fans_out_to_subscribers() {
        struct Collector(Mutex<Vec<(String, PluginState)>>);
        impl StatusListener for Collector {
            fn on_status_change(&self, plugin: &str, state: PluginState) {
                self.0.lock().unwrap().push((plugin.to_string(), state));
            }
        }

        let manager = PluginManager::new();
        let collector = Arc::new(Collector(Mutex::new(Vec::new())));
        manager.subscribe(Arc::downgrade(&collector) as Weak<dyn StatusListener>);

        manager.update_plugin_status("bundle.main", PluginState::Ok);

        assert_eq!(collector.0.lock().unwrap().as_slice(), &[("bundle.main".to_string(), PluginState::Ok)]);
        assert_eq!(manager.status("bundle.main"), Some(PluginState::Ok));
    }
}
