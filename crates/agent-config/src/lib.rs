//! Configuration document loading for the management-plane agent (§6).
//!
//! The configuration document is JSON or YAML (auto-detected), with
//! `${ENV}` substitution applied to every string value before parsing,
//! `--set key=value`/`--set-file key=path` CLI overrides applied by
//! dot-separated path (backslash-escapes a literal dot in a key), and a
//! `null` document treated as an empty object. This is the same layered
//! file-plus-CLI-flag merge shape as a config file loader with flag
//! overrides, generalized from a single document to the richer nested
//! structure §6 describes.

use std::collections::BTreeMap;
use std::path::Path;

use agent_types::{Key, Labels, Service, TriggerMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default persistence directory when `persistence_directory` is omitted.
pub const DEFAULT_PERSISTENCE_DIR: &str = ".opa";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration as JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse configuration as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(
        "both legacy `bundle` and `bundles` are configured; behavior is undefined, configure only one"
    )]
    LegacyBundleConflict,

    #[error("--set path {path:?} is invalid: {reason}")]
    InvalidSetPath { path: String, reason: String },

    #[error("--set-file target {path} could not be read: {source}")]
    SetFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery trigger mode disagreement: child plugin {plugin} declared {declared:?}, discovery uses {discovery:?}")]
    TriggerModeConflict {
        plugin: String,
        declared: TriggerMode,
        discovery: TriggerMode,
    },

    #[error("duplicate service name {0:?}: services must be uniquely named")]
    DuplicateService(String),
}

/// Top-level configuration document (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Accepts either the ordered-sequence form or a mapping whose keys
    /// override each entry's `name` (§3 Service, §6 `services[]`).
    #[serde(default, deserialize_with = "deserialize_services")]
    pub services: Vec<Service>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub bundles: BTreeMap<String, BundleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<LegacyBundleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_logs: Option<DecisionLogsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusConfig>,
    #[serde(default)]
    pub keys: BTreeMap<String, Key>,
    #[serde(default)]
    pub caching: CachingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_authorization_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nd_builtin_cache: Option<bool>,
    #[serde(default)]
    pub plugins: BTreeMap<String, Value>,
}

impl Config {
    pub fn persistence_dir(&self) -> &str {
        self.persistence_directory
            .as_deref()
            .unwrap_or(DEFAULT_PERSISTENCE_DIR)
    }

    /// §9 "fail fast at configuration validation" when both the legacy
    /// singular `bundle` key and the plural `bundles` map are configured.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.bundle.is_some() && !self.bundles.is_empty() {
            return Err(ConfigError::LegacyBundleConflict);
        }
        let mut seen = std::collections::BTreeSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
        }
        Ok(())
    }
}

/// Deserialize `services[]` from either the ordered-sequence form or a
/// mapping whose keys override the `name` field of each entry (§3 Service:
/// "Services may be declared as an ordered sequence or as a mapping whose
/// keys override the name field").
fn deserialize_services<'de, D>(deserializer: D) -> Result<Vec<Service>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(serde::de::Error::custom))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .map(|(name, mut item)| match &mut item {
                Value::Object(obj) => {
                    obj.insert("name".to_string(), Value::String(name));
                    serde_json::from_value(item).map_err(serde::de::Error::custom)
                }
                _ => Err(serde::de::Error::custom(format!("service entry {name:?} must be an object"))),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(serde::de::Error::custom(format!("services must be an array or a mapping, got {other}"))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_min_delay", with = "humantime_serde")]
    pub min_delay: std::time::Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: std::time::Duration,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub long_poll_timeout: Option<std::time::Duration>,
}

fn default_min_delay() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

fn default_max_delay() -> std::time::Duration {
    std::time::Duration::from_secs(120)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            long_poll_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub exclude_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerMode>,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_limit_bytes: Option<u64>,
}

/// Legacy single-bundle form, kept for backwards compatibility (§6, §9 open
/// question "legacy `bundle` singular key").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyBundleConfig {
    pub name: String,
    pub prefix: String,
    pub service: String,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerMode>,
    #[serde(default)]
    pub persist: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing: Option<SigningConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportingAdmission {
    BufferSizeLimitBytes { buffer_size_limit_bytes: u64 },
    MaxDecisionsPerSecond { max_decisions_per_second: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(flatten)]
    pub admission: Option<ReportingAdmission>,
    #[serde(default = "default_upload_size_limit_bytes")]
    pub upload_size_limit_bytes: u64,
    #[serde(default = "default_min_delay", with = "humantime_serde")]
    pub min_delay: std::time::Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: std::time::Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerMode>,
}

fn default_upload_size_limit_bytes() -> u64 {
    32 * 1024
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            admission: None,
            upload_size_limit_bytes: default_upload_size_limit_bytes(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            trigger: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default)]
    pub console: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_name: Option<String>,
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub prometheus: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default)]
    pub inter_query_builtin_cache: InterQueryBuiltinCacheConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterQueryBuiltinCacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
}

/// Which serialization the raw document bytes were auto-detected as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

/// Auto-detect JSON vs YAML: a document whose first non-whitespace byte is
/// `{` or `[` is parsed as JSON, everything else as YAML (YAML is a JSON
/// superset, so this only matters for error-message quality).
pub fn detect_format(content: &str) -> DocumentFormat {
    match content.trim_start().chars().next() {
        Some('{') | Some('[') => DocumentFormat::Json,
        _ => DocumentFormat::Yaml,
    }
}

fn parse_document(content: &str) -> Result<Value, ConfigError> {
    let value = match detect_format(content) {
        DocumentFormat::Json => serde_json::from_str(content)?,
        DocumentFormat::Yaml => {
            let yaml_value: serde_yaml::Value = serde_yaml::from_str(content)?;
            serde_json::to_value(yaml_value).map_err(ConfigError::Json)?
        }
    };

    // "`null` produces an empty object" (§6).
    Ok(match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    })
}

/// Replace every `${VAR}` occurrence in string values with the environment
/// variable's value, recursively. Undefined variables become the empty
/// string, never an error (§6).
pub fn substitute_env(value: &mut Value) {
    match value {
        Value::String(s) => {
            *s = substitute_env_str(s);
        }
        Value::Array(items) => {
            for item in items {
                substitute_env(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v);
            }
        }
        _ => {}
    }
}

fn substitute_env_str(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let var_name = &input[i + 2..i + 2 + end];
                output.push_str(&std::env::var(var_name).unwrap_or_default());
                i += 2 + end + 1;
                continue;
            }
        }
        let c = input[i..].chars().next().expect("i < bytes.len()");
        output.push(c);
        i += c.len_utf8();
    }
    output
}

/// Split a `--set`/`--set-file` path on unescaped dots; `\.` is a literal
/// dot inside a single path segment (§6).
fn split_set_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => {
                segments.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}

/// Apply a single `--set key=value` override. Lists are replaced wholesale,
/// not merged (§6): if `value` parses as JSON it is used as-is (so
/// `--set tags=[1,2]` sets an array), otherwise it is stored as a string.
pub fn apply_set(root: &mut Value, path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parsed = serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()));
    set_at_path(root, path, parsed)
}

/// Apply a single `--set-file key=path` override: the file's contents
/// become the string value at `path`.
pub fn apply_set_file(root: &mut Value, path: &str, file_path: &Path) -> Result<(), ConfigError> {
    let content = std::fs::read_to_string(file_path).map_err(|e| ConfigError::SetFileIo {
        path: file_path.display().to_string(),
        source: e,
    })?;
    set_at_path(root, path, Value::String(content))
}

fn set_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), ConfigError> {
    let segments = split_set_path(path);
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ConfigError::InvalidSetPath {
            path: path.to_string(),
            reason: "path segments must not be empty".to_string(),
        });
    }

    let mut cursor = root;
    for segment in &segments[..segments.len() - 1] {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        cursor = cursor
            .as_object_mut()
            .expect("just coerced to object")
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Default::default()));
    }

    if !cursor.is_object() {
        *cursor = Value::Object(Default::default());
    }
    cursor
        .as_object_mut()
        .expect("just coerced to object")
        .insert(segments.last().cloned().unwrap_or_default(), new_value);

    Ok(())
}

/// Load and parse a configuration document from raw bytes, applying
/// `${ENV}` substitution and any CLI overrides, then validating it.
pub fn load_from_str(
    content: &str,
    set_overrides: &[(String, String)],
    set_file_overrides: &[(String, &Path)],
) -> Result<Config, ConfigError> {
    let mut value = parse_document(content)?;
    substitute_env(&mut value);

    for (path, raw) in set_overrides {
        apply_set(&mut value, path, raw)?;
    }
    for (path, file_path) in set_file_overrides {
        apply_set_file(&mut value, path, file_path)?;
    }

    let config: Config = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}

/// Load a configuration document from a file on disk.
pub fn load_from_file(
    path: &Path,
    set_overrides: &[(String, String)],
    set_file_overrides: &[(String, &Path)],
) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_from_str(&content, set_overrides, set_file_overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detect_format_prefers_json_for_brace_prefixed_content() {
        assert_eq!(detect_format("{\"a\": 1}"), DocumentFormat::Json);
        assert_eq!(detect_format("  [1, 2]"), DocumentFormat::Json);
        assert_eq!(detect_format("a: 1\nb: 2"), DocumentFormat::Yaml);
    }

    #[test]
    fn null_document_becomes_empty_object() {
        let value = parse_document("null").unwrap();
        assert_eq!(value, Value::Object(Default::default()));
    }

    #[test]
    fn env_substitution_replaces_defined_vars_and_blanks_undefined() {
        temp_env::with_var("AGENT_TEST_TOKEN", Some("s3cr3t"), || {
            let mut value = Value::String("Bearer ${AGENT_TEST_TOKEN} / ${AGENT_UNDEFINED_VAR}".to_string());
            substitute_env(&mut value);
            assert_eq!(value, Value::String("Bearer s3cr3t / ".to_string()));
        });
    }

    #[test]
    fn split_set_path_handles_escaped_dots() {
        assert_eq!(split_set_path("bundles.main.service"), vec!["bundles", "main", "service"]);
        assert_eq!(split_set_path(r"labels.example\.com"), vec!["labels", "example.com"]);
    }

    #[test]
    fn apply_set_creates_nested_path() {
        let mut root = Value::Object(Default::default());
        apply_set(&mut root, "bundles.main.service", "\"registry\"").unwrap();
        assert_eq!(root["bundles"]["main"]["service"], Value::String("registry".to_string()));
    }

    #[test]
    fn apply_set_replaces_list_wholesale() {
        let mut root = serde_json::json!({"signing": {"exclude_files": ["a"]}});
        apply_set(&mut root, "signing.exclude_files", "[\"b\",\"c\"]").unwrap();
        assert_eq!(root["signing"]["exclude_files"], serde_json::json!(["b", "c"]));
    }

    #[test]
    fn legacy_bundle_and_bundles_together_fails_validation() {
        let content = r#"
bundle:
  name: main
  prefix: ""
  service: registry
bundles:
  other:
    service: registry
"#;
        let err = load_from_str(content, &[], &[]).unwrap_err();
        assert!(matches!(err, ConfigError::LegacyBundleConflict));
    }

    #[test]
    fn loads_yaml_document_with_services_and_labels() {
        let content = r#"
services:
  - name: registry
    url: https://example.com
labels:
  region: us
bundles:
  main:
    service: registry
    resource: bundles/main
"#;
        let config = load_from_str(content, &[], &[]).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.labels.get("region"), Some(&"us".to_string()));
        assert!(config.bundles.contains_key("main"));
    }

    #[test]
    fn load_from_file_roundtrips_through_set_file_override() {
        let td = tempdir().expect("tempdir");
        let config_path = td.path().join("config.yaml");
        std::fs::write(&config_path, "services: []\n").unwrap();

        let secret_path = td.path().join("token.txt");
        std::fs::write(&secret_path, "file-token").unwrap();

        let config = load_from_file(
            &config_path,
            &[],
            &[("default_decision".to_string(), secret_path.as_path())],
        )
        .unwrap();
        assert_eq!(config.default_decision.as_deref(), Some("file-token"));
    }

    #[test]
    fn persistence_dir_defaults_when_unset() {
        let config = Config::default();
        assert_eq!(config.persistence_dir(), DEFAULT_PERSISTENCE_DIR);
    }

    #[test]
    fn services_map_form_uses_keys_as_names_and_overrides_inline_name() {
        let content = r#"
services:
  registry:
    url: https://example.com
  control-plane:
    name: ignored
    url: https://control.example.com
"#;
        let config = load_from_str(content, &[], &[]).unwrap();
        let names: Vec<_> = config.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["control-plane", "registry"]);
    }

    #[test]
    fn services_array_form_still_works() {
        let content = r#"
services:
  - name: registry
    url: https://example.com
"#;
        let config = load_from_str(content, &[], &[]).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "registry");
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let content = r#"
services:
  - name: registry
    url: https://a.example.com
  - name: registry
    url: https://b.example.com
"#;
        let err = load_from_str(content, &[], &[]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateService(name) if name == "registry"));
    }

}
