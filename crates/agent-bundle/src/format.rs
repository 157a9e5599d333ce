//! Bundle archive format: gzip(tar) reader/writer (§4.B, §6 "Bundle archive
//! wire format").
//!
//! On read, every entry's raw bytes are kept in [`Bundle::raw_files`] (the
//! signature verifier needs the exact archive bytes, not a re-serialization)
//! while `.manifest`, `*/data.json`/`*/data.yaml`, and `*.rego` entries are
//! additionally decoded into the structured [`Bundle`] fields. On write, the
//! same raw bytes are re-emitted in a deterministic order so that signing is
//! reproducible across runs (§4.B "On write").

use std::collections::BTreeMap;
use std::io::{Read, Write};

use agent_types::{Bundle, Manifest, Module, SignatureEnvelope, WasmModule};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use thiserror::Error;

/// Default per-file size cap (§4.B "default 1 GiB").
pub const DEFAULT_FILE_SIZE_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("i/o error reading bundle archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {path} as JSON: {source}")]
    Json { path: String, source: serde_json::Error },

    #[error("failed to parse {path} as YAML: {source}")]
    Yaml { path: String, source: serde_yaml::Error },

    #[error("archive entry {path} exceeds the per-file size limit of {limit} bytes")]
    FileTooLarge { path: String, limit: u64 },

    #[error("YAML file {path} uses a `!!binary` tagged value, which bundles cannot carry")]
    BinaryYamlValue { path: String },

    #[error("YAML file {path} has a null map key")]
    NullMapKey { path: String },

    #[error("YAML file {path} has an unsupported (non-scalar) map key")]
    UnsupportedMapKey { path: String },

    #[error("archive is missing a `.manifest` entry")]
    MissingManifest,

    #[error("module {path} could not be parsed: {reason}")]
    InvalidModule { path: String, reason: String },
}

/// Whether `path` is recognized as a structured (JSON/YAML) file whose
/// digest must be taken over a canonicalized encoding (§3 "Structured-file
/// canonicalization").
pub fn is_structured_file(path: &str) -> bool {
    path.ends_with(".json") || path.ends_with(".yaml") || path.ends_with(".yml")
}

/// Canonical bytes for a structured file: parse as JSON or YAML (auto-detect
/// by looking at the first non-whitespace byte, same heuristic
/// `agent-config` uses) and re-serialize through `serde_json`. This relies
/// on `serde_json::Map` being `BTreeMap`-backed by default (the
/// `preserve_order` feature is not enabled anywhere in this workspace), so a
/// plain `serde_json::to_vec` already produces keys sorted recursively — no
/// hand-rolled key-sorting pass is needed.
pub fn canonical_bytes_for(path: &str, raw: &[u8]) -> Result<Vec<u8>, BundleError> {
    let value = parse_structured(path, raw)?;
    Ok(serde_json::to_vec(&value).expect("serde_json::Value serialization is infallible"))
}

fn parse_structured(path: &str, raw: &[u8]) -> Result<Value, BundleError> {
    let text = String::from_utf8_lossy(raw);
    match text.trim_start().chars().next() {
        Some('{') | Some('[') => serde_json::from_str(&text).map_err(|source| BundleError::Json {
            path: path.to_string(),
            source,
        }),
        _ => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|source| BundleError::Yaml {
                path: path.to_string(),
                source,
            })?;
            yaml_to_json(path, yaml)
        }
    }
}

/// Convert a parsed YAML value into JSON, rejecting `!!binary` tags and null
/// map keys, and coercing boolean/number map keys to strings (§4.B).
fn yaml_to_json(path: &str, value: serde_yaml::Value) -> Result<Value, BundleError> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_yaml::Value::Number(n) => serde_json::to_value(n).map_err(|source| BundleError::Json {
            path: path.to_string(),
            source,
        }),
        serde_yaml::Value::String(s) => Ok(Value::String(s)),
        serde_yaml::Value::Sequence(items) => items
            .into_iter()
            .map(|item| yaml_to_json(path, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        serde_yaml::Value::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map {
                let key = yaml_key_to_string(path, &key)?;
                object.insert(key, yaml_to_json(path, value)?);
            }
            Ok(Value::Object(object))
        }
        serde_yaml::Value::Tagged(tagged) => {
            if tagged.tag.to_string().to_ascii_lowercase().contains("binary") {
                return Err(BundleError::BinaryYamlValue { path: path.to_string() });
            }
            yaml_to_json(path, tagged.value)
        }
    }
}

fn yaml_key_to_string(path: &str, key: &serde_yaml::Value) -> Result<String, BundleError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Null => Err(BundleError::NullMapKey { path: path.to_string() }),
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) | serde_yaml::Value::Tagged(_) => {
            Err(BundleError::UnsupportedMapKey { path: path.to_string() })
        }
    }
}

/// Directory component of an archive path, used to place a `data.json`
/// fragment at the right spot in the merged data tree (e.g.
/// `authz/data.json` contributes at `authz`; a top-level `data.json`
/// contributes at the tree root).
fn data_mount_point(path: &str) -> Vec<String> {
    let mut segments: Vec<&str> = path.split('/').collect();
    segments.pop(); // drop the filename itself
    segments.into_iter().filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn mount_fragment(tree: &mut Value, mount: &[String], fragment: Value) {
    if mount.is_empty() {
        if let (Value::Object(existing), Value::Object(incoming)) = (&mut *tree, &fragment) {
            for (k, v) in incoming {
                existing.insert(k.clone(), v.clone());
            }
            return;
        }
        *tree = fragment;
        return;
    }
    if !tree.is_object() {
        *tree = Value::Object(Default::default());
    }
    let mut cursor = tree;
    for segment in mount {
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        cursor = cursor
            .as_object_mut()
            .expect("just coerced to object")
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    *cursor = fragment;
}

/// Extract the `package` declaration from a `.rego` module's source, e.g.
/// `package authz.http.api` -> `authz/http/api`. Best-effort: takes the
/// first `package` statement found, trimming comments and the trailing
/// dotted path's separator.
fn parse_package(path: &str, raw: &str) -> Result<String, BundleError> {
    for line in raw.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if let Some(rest) = line.strip_prefix("package ") {
            let ident = rest.trim().trim_end_matches(';').trim();
            if ident.is_empty() {
                continue;
            }
            return Ok(ident.to_string());
        }
    }
    Err(BundleError::InvalidModule {
        path: path.to_string(),
        reason: "no `package` declaration found".to_string(),
    })
}

/// Read a gzipped tar stream into an in-memory [`Bundle`] (§4.B "On read").
pub fn read_bundle(name: &str, bytes: &[u8], size_limit_bytes: u64) -> Result<Bundle, BundleError> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);

    let mut raw_files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut manifest: Option<Manifest> = None;
    let mut signatures: Option<SignatureEnvelope> = None;
    let mut data = Value::Object(Default::default());
    let mut modules = Vec::new();
    let mut wasm = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_start_matches('/').replace('\\', "/");
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let mut limited = Read::take(&mut entry, size_limit_bytes + 1);
        let mut buf = Vec::new();
        limited.read_to_end(&mut buf)?;
        if buf.len() as u64 > size_limit_bytes {
            return Err(BundleError::FileTooLarge {
                path,
                limit: size_limit_bytes,
            });
        }

        match path.as_str() {
            ".manifest" => {
                manifest = Some(serde_json::from_slice(&buf).map_err(|source| BundleError::Json {
                    path: path.clone(),
                    source,
                })?);
            }
            ".signatures.json" => {
                signatures = Some(serde_json::from_slice(&buf).map_err(|source| BundleError::Json {
                    path: path.clone(),
                    source,
                })?);
            }
            "/policy.wasm" | "policy.wasm" => {
                wasm.push(WasmModule {
                    path: path.clone(),
                    bytes: buf.clone(),
                });
            }
            _ if path.ends_with("/data.json") || path == "data.json" => {
                let value = parse_structured(&path, &buf)?;
                mount_fragment(&mut data, &data_mount_point(&path), value);
            }
            _ if path.ends_with("/data.yaml") || path == "data.yaml" => {
                let value = parse_structured(&path, &buf)?;
                mount_fragment(&mut data, &data_mount_point(&path), value);
            }
            _ if path.ends_with(".rego") => {
                let raw = String::from_utf8_lossy(&buf).into_owned();
                let package = parse_package(&path, &raw)?;
                modules.push(Module {
                    path: path.clone(),
                    raw,
                    package,
                });
            }
            _ => {
                // Other `.json`/`.yaml` files are silently ignored as data
                // sources (§4.B) but still kept in `raw_files` for signing.
            }
        }

        raw_files.insert(path, buf);
    }

    let manifest = manifest.ok_or(BundleError::MissingManifest)?;

    Ok(Bundle {
        name: name.to_string(),
        manifest,
        modules,
        data,
        wasm,
        signatures,
        raw_files,
    })
}

/// Write a [`Bundle`] back out as a gzipped tar stream, in a deterministic
/// entry order so that signing over the result is reproducible (§4.B "On
/// write"): `.manifest` first, then every other raw file sorted by path,
/// then `.signatures.json` last if present.
pub fn write_bundle(bundle: &Bundle) -> Result<Vec<u8>, BundleError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    if let Some(manifest_bytes) = bundle.raw_files.get(".manifest") {
        append_entry(&mut builder, ".manifest", manifest_bytes)?;
    } else {
        let bytes = serde_json::to_vec(&bundle.manifest).expect("manifest serialization is infallible");
        append_entry(&mut builder, ".manifest", &bytes)?;
    }

    for (path, contents) in &bundle.raw_files {
        if path == ".manifest" || path == ".signatures.json" {
            continue;
        }
        append_entry(&mut builder, path, contents)?;
    }

    if let Some(envelope) = &bundle.signatures {
        let bytes = serde_json::to_vec(envelope).expect("signature envelope serialization is infallible");
        append_entry(&mut builder, ".signatures.json", &bytes)?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish().map_err(BundleError::Io)
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, path: &str, contents: &[u8]) -> Result<(), BundleError> {
    let mut header = tar::Header::new_gnu();
    header.set_path(path)?;
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn build_test_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn reads_manifest_data_and_modules() {
        let manifest = br#"{"revision":"v1","roots":["authz"]}"#;
        let data = br#"{"enabled":true}"#;
        let rego = b"package authz.http.api\n\nallow { true }\n";
        let archive = build_test_archive(&[
            (".manifest", manifest),
            ("authz/data.json", data),
            ("authz/policy.rego", rego),
        ]);

        let bundle = read_bundle("main", &archive, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap();
        assert_eq!(bundle.manifest.revision, "v1");
        assert_eq!(bundle.manifest.effective_roots(), vec!["authz".to_string()]);
        assert_eq!(bundle.data, serde_json::json!({"authz": {"enabled": true}}));
        assert_eq!(bundle.modules.len(), 1);
        assert_eq!(bundle.modules[0].package, "authz.http.api");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let archive = build_test_archive(&[("authz/data.json", b"{}")]);
        let err = read_bundle("main", &archive, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap_err();
        assert!(matches!(err, BundleError::MissingManifest));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let manifest = br#"{"revision":"v1"}"#;
        let big = vec![0u8; 64];
        let archive = build_test_archive(&[(".manifest", manifest), ("authz/data.json", &big)]);
        let err = read_bundle("main", &archive, 10).unwrap_err();
        assert!(matches!(err, BundleError::FileTooLarge { .. }));
    }

    #[test]
    fn yaml_data_file_converts_to_json() {
        let manifest = br#"{"revision":"v1"}"#;
        let yaml = b"enabled: true\ncount: 3\n";
        let archive = build_test_archive(&[(".manifest", manifest), ("authz/data.yaml", yaml)]);
        let bundle = read_bundle("main", &archive, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap();
        assert_eq!(bundle.data, serde_json::json!({"authz": {"enabled": true, "count": 3}}));
    }

    #[test]
    fn non_data_json_files_are_ignored_but_kept_as_raw() {
        let manifest = br#"{"revision":"v1"}"#;
        let stray = br#"{"not":"data"}"#;
        let archive = build_test_archive(&[(".manifest", manifest), ("authz/other.json", stray)]);
        let bundle = read_bundle("main", &archive, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap();
        assert_eq!(bundle.data, serde_json::json!({}));
        assert!(bundle.raw_files.contains_key("authz/other.json"));
    }

    #[test]
    fn yaml_null_map_key_is_rejected() {
        let err = yaml_to_json("x.yaml", serde_yaml::from_str("? \nfoo: 1").unwrap()).unwrap_err();
        assert!(matches!(err, BundleError::NullMapKey { .. }));
    }

    #[test]
    fn yaml_bool_and_number_keys_coerce_to_strings() {
        let parsed = yaml_to_json("x.yaml", serde_yaml::from_str("true: a\n1: b").unwrap()).unwrap();
        assert_eq!(parsed, serde_json::json!({"true": "a", "1": "b"}));
    }

    #[test]
    fn canonical_bytes_sort_keys_regardless_of_source_order() {
        let a = canonical_bytes_for("x.json", br#"{"b":1,"a":2}"#).unwrap();
        let b = canonical_bytes_for("x.json", br#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn write_then_read_round_trips_up_to_canonical_ordering() {
        let manifest = br#"{"revision":"v1","roots":["authz"]}"#;
        let data = br#"{"enabled":true}"#;
        let archive = build_test_archive(&[(".manifest", manifest), ("authz/data.json", data)]);
        let bundle = read_bundle("main", &archive, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap();

        let written = write_bundle(&bundle).unwrap();
        let reread = read_bundle("main", &written, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap();

        assert_eq!(reread.manifest.revision, bundle.manifest.revision);
        assert_eq!(reread.data, bundle.data);
        assert_eq!(reread.raw_files, bundle.raw_files);
    }

    #[test]
    fn write_bundle_orders_manifest_first_and_signatures_last() {
        let manifest = br#"{"revision":"v1"}"#;
        let archive = build_test_archive(&[(".manifest", manifest), ("z/data.json", b"{}"), ("a/data.json", b"{}")]);
        let mut bundle = read_bundle("main", &archive, DEFAULT_FILE_SIZE_LIMIT_BYTES).unwrap();
        bundle.signatures = Some(SignatureEnvelope {
            signatures: vec!["header.payload.sig".to_string()],
        });

        let written = write_bundle(&bundle).unwrap();
        let decoder = GzDecoder::new(written.as_slice());
        let mut archive = tar::Archive::new(decoder);
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(paths.first().unwrap(), ".manifest");
        assert_eq!(paths.last().unwrap(), ".signatures.json");
    }
}
