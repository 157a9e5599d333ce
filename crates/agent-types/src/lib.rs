//! # agent-types
//!
//! Shared data model for the management-plane agent: the wire and
//! in-memory representations of bundles, manifests, signature envelopes,
//! services, keys, decision events and status snapshots described in the
//! agent's data model. Every other crate in the workspace depends on this
//! one; it carries no I/O of its own.
//!
//! ## Serialization
//!
//! Types mirror the JSON/YAML documents the agent reads from the control
//! plane and the bundle archive, so `Serialize`/`Deserialize` shapes are
//! load-bearing, not incidental.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod evaluator;
pub mod labels;
pub use evaluator::{EvalError, EvalFuture, Evaluator};
pub use labels::Labels;

/// Top-level error kinds from the error-handling design (see workspace docs).
///
/// Each subsystem crate keeps its own narrower `thiserror` enum and converts
/// into this one at the runtime boundary; `agent-runtime`/`agent-cli` collect
/// `AgentError` into `anyhow::Error` at the process edge.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("http error: status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("mask policy error: {0}")]
    MaskPolicy(String),
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("rate limited")]
    RateLimited,
}

/// Per-plugin readiness state (ownership rules, §4.J).
///
/// `NotReady` until at least one successful activation (or recovery from
/// persistence); `Err` carries no payload here because the message lives in
/// the corresponding [`StatusSnapshot`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    NotReady,
    Ok,
    Err,
}

/// Whether a downloader/uploader polls on a timer or waits for an explicit
/// `Trigger()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Periodic,
    Manual,
}

/// JWS signing/verification algorithms accepted for signature envelopes and
/// configured keys (§4.C, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JwsAlgorithm {
    ES256,
    ES384,
    ES512,
    HS256,
    HS384,
    HS512,
    PS256,
    PS384,
    PS512,
    RS256,
    RS384,
    RS512,
}

impl JwsAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            JwsAlgorithm::ES256 => "ES256",
            JwsAlgorithm::ES384 => "ES384",
            JwsAlgorithm::ES512 => "ES512",
            JwsAlgorithm::HS256 => "HS256",
            JwsAlgorithm::HS384 => "HS384",
            JwsAlgorithm::HS512 => "HS512",
            JwsAlgorithm::PS256 => "PS256",
            JwsAlgorithm::PS384 => "PS384",
            JwsAlgorithm::PS512 => "PS512",
            JwsAlgorithm::RS256 => "RS256",
            JwsAlgorithm::RS384 => "RS384",
            JwsAlgorithm::RS512 => "RS512",
        }
    }

    pub fn is_hmac(&self) -> bool {
        matches!(self, JwsAlgorithm::HS256 | JwsAlgorithm::HS384 | JwsAlgorithm::HS512)
    }
}

/// File digest algorithms accepted by the signature verifier (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Md5,
    #[serde(rename = "sha1")]
    Sha1,
    #[serde(rename = "sha224")]
    Sha224,
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "sha384")]
    Sha384,
    #[serde(rename = "sha512")]
    Sha512,
    #[serde(rename = "sha512-224")]
    Sha512_224,
    #[serde(rename = "sha512-256")]
    Sha512_256,
}

/// Key material, either for verification (public) or signing (private).
///
/// HMAC keys are symmetric so `Public`/`Private` collapse to the same bytes;
/// callers pick the arm that matches how the key was configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyMaterial {
    /// PEM-encoded public key, or a raw HMAC secret.
    Public(String),
    /// PEM-encoded private key, or a raw HMAC secret.
    Private(String),
}

/// A named signing/verification key (§3 Key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub algorithm: JwsAlgorithm,
    pub material: KeyMaterial,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A single entry in a signature envelope's JWS payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSignature {
    pub name: String,
    pub hash: String,
    pub algorithm: HashAlgorithm,
}

/// The decoded payload of a bundle's `.signatures.json` JWS token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub files: Vec<FileSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_files: Vec<String>,
}

/// Raw contents of a bundle's `.signatures.json`: a list of JWS compact
/// tokens (today, always exactly one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub signatures: Vec<String>,
}

/// A bundle's `.manifest` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub revision: String,
    #[serde(default)]
    pub roots: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rego_version: Option<String>,
}

impl Manifest {
    /// Roots default to `[""]` (owns everything) when absent (§4.F).
    pub fn effective_roots(&self) -> Vec<String> {
        match &self.roots {
            Some(roots) if !roots.is_empty() => roots.clone(),
            _ => vec![String::new()],
        }
    }
}

/// A policy source file inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Path within the archive, e.g. `policy/authz.rego`.
    pub path: String,
    /// Raw `.rego` source.
    pub raw: String,
    /// Declared package, e.g. `authz.http.api` -> root `authz/http/api`.
    pub package: String,
}

/// A compiled wasm module entry (`/policy.wasm`), kept opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmModule {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// An in-memory bundle: the unit of activation (§3 Bundle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub manifest: Manifest,
    #[serde(default)]
    pub modules: Vec<Module>,
    /// Hierarchical JSON merged from every `data.json`/`data.yaml` entry,
    /// keyed by the directory path each file lived at.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub wasm: Vec<WasmModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<SignatureEnvelope>,
    /// Raw bytes of every archive entry except `.signatures.json`, keyed by
    /// path, kept around for signature verification and deterministic
    /// re-serialization.
    #[serde(skip)]
    pub raw_files: BTreeMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn roots(&self) -> Vec<String> {
        self.manifest.effective_roots()
    }
}

/// TLS configuration for a [`Service`] (§4.A).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub system_ca: bool,
    #[serde(default)]
    pub allow_insecure_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_env: Option<String>,
}

/// A named remote endpoint (§3 Service, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub response_header_timeout_seconds: Option<u64>,
    /// Name of the credential-provider block configured for this service;
    /// resolution into an actual provider happens in `agent-auth`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}

/// A single decision-log event (§3 Decision event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    #[serde(default)]
    pub labels: Labels,
    pub decision_id: String,
    #[serde(default)]
    pub bundles: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub erased: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nd_builtin_cache: Option<serde_json::Value>,
}

impl DecisionEvent {
    /// Approximate on-wire size, used by the chunker (§4.H) to bound a gzip
    /// chunk's uncompressed input.
    pub fn approx_json_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Strip `nd_builtin_cache` so a single oversized event can still fit a
    /// chunk (§4.H).
    pub fn strip_nd_builtin_cache(&mut self) {
        self.nd_builtin_cache = None;
    }
}

/// Per-bundle health, part of a [`StatusSnapshot`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_request: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_download: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_activation: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Per-plugin health, part of a [`StatusSnapshot`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PluginStatus {
    pub state: PluginState,
}

/// The full status snapshot pushed by the Status Plugin on state
/// transitions (§3 Status snapshot, §4.I).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub bundles: BTreeMap<String, BundleStatus>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginStatus>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl StatusSnapshot {
    /// Not ready until every bundle has an active revision (§7 User-visible).
    pub fn bundles_ready(&self) -> bool {
        self.bundles.values().all(|b| b.active_revision.is_some())
    }

    pub fn plugins_ready(&self) -> bool {
        self.plugins.values().all(|p| p.state != PluginState::Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_roots_to_own_everything() {
        let m = Manifest {
            revision: "v1".into(),
            roots: None,
            rego_version: None,
        };
        assert_eq!(m.effective_roots(), vec![String::new()]);
    }

    #[test]
    fn manifest_empty_roots_list_also_defaults() {
        let m = Manifest {
            revision: "v1".into(),
            roots: Some(vec![]),
            rego_version: None,
        };
        assert_eq!(m.effective_roots(), vec![String::new()]);
    }

    #[test]
    fn plugin_state_default_is_not_ready() {
        assert_eq!(PluginState::default(), PluginState::NotReady);
    }

    #[test]
    fn status_snapshot_not_ready_until_all_bundles_active() {
        let mut snap = StatusSnapshot::default();
        snap.bundles.insert(
            "main".into(),
            BundleStatus {
                name: "main".into(),
                ..Default::default()
            },
        );
        assert!(!snap.bundles_ready());
        snap.bundles.get_mut("main").unwrap().active_revision = Some("v1".into());
        assert!(snap.bundles_ready());
    }

    #[test]
    fn jws_algorithm_serializes_uppercase() {
        let json = serde_json::to_string(&JwsAlgorithm::RS256).unwrap();
        assert_eq!(json, "\"RS256\"");
    }

    #[test]
    fn hash_algorithm_roundtrip() {
        for (variant, label) in [
            (HashAlgorithm::Sha256, "\"sha256\""),
            (HashAlgorithm::Sha512_224, "\"sha512-224\""),
            (HashAlgorithm::Md5, "\"md5\""),
        ] {
            let json = serde_json::to_string(&variant).unwrap();
            assert_eq!(json, label);
            let parsed: HashAlgorithm = serde_json::from_str(&json).unwrap();
            assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
        }
    }

    #[test]
    fn decision_event_strips_nd_builtin_cache() {
        let mut ev = DecisionEvent {
            labels: Labels::default(),
            decision_id: "d1".into(),
            bundles: BTreeMap::new(),
            path: Some("/authz/allow".into()),
            query: None,
            input: serde_json::json!({}),
            result: serde_json::json!(true),
            requested_by: None,
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
            erased: vec![],
            masked: vec![],
            nd_builtin_cache: Some(serde_json::json!({"big": "blob"})),
        };
        ev.strip_nd_builtin_cache();
        assert!(ev.nd_builtin_cache.is_none());
    }

    proptest::proptest! {
        #[test]
        fn bundle_status_roundtrips(
            name in "[a-z][a-z0-9_]*",
            code in proptest::option::of("[a-z_]+"),
        ) {
            let status = BundleStatus {
                name: name.clone(),
                code: code.clone(),
                ..Default::default()
            };
            let json = serde_json::to_string(&status).unwrap();
            let parsed: BundleStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.name, name);
            assert_eq!(parsed.code, code);
        }
    }
}
