//! Transactional policy/data store (§4.D Store Adapter).
//!
//! [`Store`] is shared by every plugin that activates bundles; mutation only
//! ever happens through [`Store::apply`], which erases a bundle's prior
//! footprint, writes its new data tree and modules, and validates the
//! aggregate (no two bundles may claim overlapping roots) before committing.
//! Any validation failure aborts the whole transaction and leaves the prior
//! active set untouched — the **atomic activation** guarantee.

use std::collections::BTreeMap;
use std::sync::RwLock;

use agent_types::Module;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bundle {bundle} root {root:?} overlaps an incumbent root owned by {other}")]
    RootOverlap {
        bundle: String,
        root: String,
        other: String,
    },

    #[error("bundle {bundle} declares roots [\"\"] (owns everything) alongside other active bundles")]
    UnboundedRootConflict { bundle: String },

    #[error("module {path} package {package:?} does not lie under any root of bundle {bundle}")]
    ModuleOutsideRoots {
        bundle: String,
        path: String,
        package: String,
    },
}

/// A single bundle's contribution to a transaction (§4.D steps 2a-2c).
#[derive(Debug, Clone, Default)]
pub struct BundleActivation {
    pub name: String,
    pub roots: Vec<String>,
    pub data: Value,
    pub modules: Vec<Module>,
}

/// A write transaction: every bundle being (re)activated together.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub activations: Vec<BundleActivation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(mut self, activation: BundleActivation) -> Self {
        self.activations.push(activation);
        self
    }
}

/// Read-only view of the committed store, handed to evaluators.
pub trait Store: Send + Sync {
    /// Merged data tree across every active bundle.
    fn data(&self) -> Value;

    /// Every compiled module across every active bundle.
    fn modules(&self) -> Vec<Module>;

    /// Currently active roots, keyed by owning bundle name.
    fn active_roots(&self) -> BTreeMap<String, Vec<String>>;

    /// Apply a transaction (§4.D). On any validation error the store is left
    /// exactly as it was before the call.
    fn apply(&self, txn: Transaction) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    data: Value,
    modules: BTreeMap<String, (String, Module)>, // path -> (owning bundle, module)
    roots: BTreeMap<String, Vec<String>>,         // bundle name -> roots
}

impl StoreState {
    fn new() -> Self {
        Self {
            data: Value::Object(Default::default()),
            modules: BTreeMap::new(),
            roots: BTreeMap::new(),
        }
    }
}

/// Default in-memory implementation backed by a `BTreeMap`/`serde_json::Value`
/// tree, guarded by a single `RwLock` (§5 "store snapshot isolation").
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
        }
    }
}

impl Store for InMemoryStore {
    fn data(&self) -> Value {
        self.state.read().expect("store lock poisoned").data.clone()
    }

    fn modules(&self) -> Vec<Module> {
        self.state
            .read()
            .expect("store lock poisoned")
            .modules
            .values()
            .map(|(_, module)| module.clone())
            .collect()
    }

    fn active_roots(&self) -> BTreeMap<String, Vec<String>> {
        self.state.read().expect("store lock poisoned").roots.clone()
    }

    fn apply(&self, txn: Transaction) -> Result<(), StoreError> {
        let mut guard = self.state.write().expect("store lock poisoned");
        let snapshot = guard.clone();

        for activation in &txn.activations {
            // 2a. Erase all policy and data strictly under the bundle's
            // previously-committed roots.
            if let Some(old_roots) = guard.roots.get(&activation.name).cloned() {
                for root in &old_roots {
                    erase_at(&mut guard.data, root);
                }
                guard.modules.retain(|_, (owner, _)| owner != &activation.name);
            }

            // 2b. Write new data tree.
            for root in &activation.roots {
                let fragment = select_at(&activation.data, root);
                merge_at(&mut guard.data, root, fragment);
            }

            // 2c. Upsert compiled modules.
            for module in &activation.modules {
                guard
                    .modules
                    .insert(module.path.clone(), (activation.name.clone(), module.clone()));
            }

            guard.roots.insert(activation.name.clone(), activation.roots.clone());
        }

        if let Err(err) = validate_aggregate(&guard) {
            *guard = snapshot;
            return Err(err);
        }

        Ok(())
    }
}

/// Step 3: "no two active bundles claim overlapping roots; every module's
/// package lies under some root of the bundle it came from".
fn validate_aggregate(state: &StoreState) -> Result<(), StoreError> {
    let entries: Vec<(&String, &Vec<String>)> = state.roots.iter().collect();

    for i in 0..entries.len() {
        let (bundle, roots) = entries[i];
        if roots.iter().any(|r| r.is_empty()) && entries.len() > 1 {
            return Err(StoreError::UnboundedRootConflict {
                bundle: bundle.clone(),
            });
        }
        for j in (i + 1)..entries.len() {
            let (other_bundle, other_roots) = entries[j];
            for root in roots {
                for other_root in other_roots {
                    if roots_overlap(root, other_root) {
                        return Err(StoreError::RootOverlap {
                            bundle: bundle.clone(),
                            root: root.clone(),
                            other: other_bundle.clone(),
                        });
                    }
                }
            }
        }
    }

    for (path, (bundle, module)) in &state.modules {
        let roots = state.roots.get(bundle).cloned().unwrap_or_default();
        let package_path = module.package.replace('.', "/");
        if !roots.iter().any(|root| is_under_root(&package_path, root)) {
            return Err(StoreError::ModuleOutsideRoots {
                bundle: bundle.clone(),
                path: path.clone(),
                package: module.package.clone(),
            });
        }
    }

    Ok(())
}

/// Two roots overlap when one is a path-segment prefix of the other
/// (including equality); `""` owns everything and overlaps any other root.
fn roots_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    is_under_root(a, b) || is_under_root(b, a)
}

/// `path` lies under `root` when `root` is empty or every one of `root`'s
/// segments is a prefix of `path`'s segments.
fn is_under_root(path: &str, root: &str) -> bool {
    if root.is_empty() {
        return true;
    }
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let root_segments: Vec<&str> = root.split('/').filter(|s| !s.is_empty()).collect();
    if root_segments.len() > path_segments.len() {
        return false;
    }
    path_segments
        .iter()
        .zip(root_segments.iter())
        .all(|(p, r)| p == r)
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Remove everything strictly under `root` from `tree` (`""` clears the
/// whole tree).
fn erase_at(tree: &mut Value, root: &str) {
    let segments = path_segments(root);
    if segments.is_empty() {
        *tree = Value::Object(Default::default());
        return;
    }

    let mut cursor = tree;
    for segment in &segments[..segments.len() - 1] {
        match cursor.get_mut(*segment) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(obj) = cursor.as_object_mut() {
        obj.remove(segments[segments.len() - 1]);
    }
}

/// Extract the fragment of `data` that lives at `root`, so a bundle's
/// self-contained data document can be grafted onto the shared tree at that
/// path.
fn select_at(data: &Value, root: &str) -> Value {
    let segments = path_segments(root);
    let mut cursor = data;
    for segment in &segments {
        match cursor.get(*segment) {
            Some(next) => cursor = next,
            None => return Value::Null,
        }
    }
    cursor.clone()
}

/// Graft `fragment` into `tree` at `root`, creating intermediate objects as
/// needed.
fn merge_at(tree: &mut Value, root: &str, fragment: Value) {
    if matches!(fragment, Value::Null) {
        return;
    }
    let segments = path_segments(root);
    if segments.is_empty() {
        *tree = fragment;
        return;
    }

    let mut cursor = tree;
    for segment in &segments[..segments.len() - 1] {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        cursor = cursor
            .as_object_mut()
            .expect("just coerced to object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Default::default());
    }
    cursor
        .as_object_mut()
        .expect("just coerced to object")
        .insert(segments[segments.len() - 1].to_string(), fragment);
}
