//! Signature verification for bundle archives (§4.C).
//!
//! [`SignatureVerifier`] implements [`agent_bundle::BundleVerifier`] so
//! `agent-bundle` can drive verification without depending on this crate:
//! it locates `.signatures.json`, resolves the `kid` to verify against via
//! [`agent_keystore::Keyring::resolve`], checks the JWS, then compares each
//! declared file digest against the archive contents.

use std::collections::BTreeSet;

use agent_bundle::{BundleVerifier, VerifyFuture, canonical_bytes_for, is_structured_file};
use agent_config::SigningConfig;
use agent_keystore::{Keyring, KeystoreError};
use agent_types::{Bundle, FileSignature, HashAlgorithm, JwsAlgorithm, Key, KeyMaterial, SignaturePayload};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use sha2::Digest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("bundle {0:?} has no `.signatures.json`")]
    ErrMissingSignatures(String),

    #[error("{0}")]
    Keystore(#[from] KeystoreError),

    #[error("signature token is not valid UTF-8 compact JWS: {0}")]
    MalformedToken(String),

    #[error("JWS header declares algorithm {declared:?} but key {key:?} is configured for {configured:?}")]
    ErrAlgorithmMismatch {
        key: String,
        declared: String,
        configured: String,
    },

    #[error("JWS signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("signature payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("signature scope {found:?} does not match the configured scope {expected:?}")]
    ErrScopeMismatch { found: Option<String>, expected: Option<String> },

    #[error("file {path:?} hash mismatch: expected {expected}, computed {computed}")]
    ErrHashMismatch {
        path: String,
        expected: String,
        computed: String,
    },

    #[error("signature file set does not match archive contents: {detail}")]
    ErrFileSetMismatch { detail: String },

    #[error("JWS algorithm {0:?} is not supported by the underlying verification library")]
    UnsupportedAlgorithm(JwsAlgorithm),
}

/// `jsonwebtoken`'s `Algorithm` has no ES512 variant (its ring backend does
/// not support the P-521 curve), so that one JWS algorithm is accepted by
/// the data model (§6) but rejected here rather than silently checked
/// against the wrong curve.
fn jsonwebtoken_algorithm(algorithm: JwsAlgorithm) -> Result<Algorithm, SignError> {
    Ok(match algorithm {
        JwsAlgorithm::ES256 => Algorithm::ES256,
        JwsAlgorithm::ES384 => Algorithm::ES384,
        JwsAlgorithm::ES512 => return Err(SignError::UnsupportedAlgorithm(algorithm)),
        JwsAlgorithm::HS256 => Algorithm::HS256,
        JwsAlgorithm::HS384 => Algorithm::HS384,
        JwsAlgorithm::HS512 => Algorithm::HS512,
        JwsAlgorithm::PS256 => Algorithm::PS256,
        JwsAlgorithm::PS384 => Algorithm::PS384,
        JwsAlgorithm::PS512 => Algorithm::PS512,
        JwsAlgorithm::RS256 => Algorithm::RS256,
        JwsAlgorithm::RS384 => Algorithm::RS384,
        JwsAlgorithm::RS512 => Algorithm::RS512,
    })
}

fn decoding_key(material: &KeyMaterial, algorithm: JwsAlgorithm) -> Result<DecodingKey, SignError> {
    let pem_or_secret = match material {
        KeyMaterial::Public(s) => s,
        KeyMaterial::Private(s) => s,
    };
    if algorithm.is_hmac() {
        return Ok(DecodingKey::from_secret(pem_or_secret.as_bytes()));
    }
    match algorithm {
        JwsAlgorithm::RS256 | JwsAlgorithm::RS384 | JwsAlgorithm::RS512 | JwsAlgorithm::PS256 | JwsAlgorithm::PS384 | JwsAlgorithm::PS512 => {
            DecodingKey::from_rsa_pem(pem_or_secret.as_bytes())
                .map_err(|err| SignError::InvalidSignature(err.to_string()))
        }
        JwsAlgorithm::ES256 | JwsAlgorithm::ES384 | JwsAlgorithm::ES512 => {
            DecodingKey::from_ec_pem(pem_or_secret.as_bytes())
                .map_err(|err| SignError::InvalidSignature(err.to_string()))
        }
        _ => unreachable!("is_hmac() already handled the HMAC arms"),
    }
}

/// Digest `bytes` (or, for structured files, their canonicalized form) using
/// `algorithm`, returning the lowercase hex digest (§4.C, §3 "Structured-file
/// canonicalization").
fn digest_hex(path: &str, raw: &[u8], algorithm: HashAlgorithm) -> Result<String, agent_bundle::BundleError> {
    let bytes = if is_structured_file(path) { canonical_bytes_for(path, raw)? } else { raw.to_vec() };
    Ok(match algorithm {
        HashAlgorithm::Md5 => hex::encode(md5::compute(&bytes).0),
        HashAlgorithm::Sha1 => hex::encode(sha1::Sha1::digest(&bytes)),
        HashAlgorithm::Sha224 => hex::encode(sha2::Sha224::digest(&bytes)),
        HashAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(&bytes)),
        HashAlgorithm::Sha384 => hex::encode(sha2::Sha384::digest(&bytes)),
        HashAlgorithm::Sha512 => hex::encode(sha2::Sha512::digest(&bytes)),
        HashAlgorithm::Sha512_224 => hex::encode(sha2::Sha512_224::digest(&bytes)),
        HashAlgorithm::Sha512_256 => hex::encode(sha2::Sha512_256::digest(&bytes)),
    })
}

/// JWS-and-hash bundle verification driven by a configured [`Keyring`].
pub struct SignatureVerifier {
    keyring: Keyring,
}

impl SignatureVerifier {
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring }
    }

    /// Verify `bundle` against `signing`, resolving the key to verify under
    /// via `override_key` (§4.C "command-line override" precedence).
    pub fn verify_with_override(
        &self,
        bundle: &Bundle,
        signing: &SigningConfig,
        override_key: Option<&str>,
    ) -> Result<(), SignError> {
        let envelope = bundle
            .signatures
            .as_ref()
            .ok_or_else(|| SignError::ErrMissingSignatures(bundle.name.clone()))?;
        let token = envelope
            .signatures
            .first()
            .ok_or_else(|| SignError::ErrMissingSignatures(bundle.name.clone()))?;

        let header = decode_header(token).map_err(|err| SignError::MalformedToken(err.to_string()))?;
        let key = self.keyring.resolve(override_key, signing.keyid.as_deref(), header.kid.as_deref())?;

        self.verify_header_algorithm(key, &header)?;
        let payload = self.verify_jws(token, key)?;

        self.verify_scope(&payload, signing)?;
        self.verify_file_set(bundle, &payload)?;
        self.verify_hashes(bundle, &payload)
    }

    fn verify_header_algorithm(&self, key: &Key, header: &jsonwebtoken::Header) -> Result<(), SignError> {
        let expected = jsonwebtoken_algorithm(key.algorithm)?;
        if header.alg != expected {
            return Err(SignError::ErrAlgorithmMismatch {
                key: key.name.clone(),
                declared: format!("{:?}", header.alg),
                configured: key.algorithm.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn verify_jws(&self, token: &str, key: &Key) -> Result<SignaturePayload, SignError> {
        let decoding_key = decoding_key(&key.material, key.algorithm)?;
        let mut validation = Validation::new(jsonwebtoken_algorithm(key.algorithm)?);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<SignaturePayload>(token, &decoding_key, &validation)
            .map_err(|err| SignError::InvalidSignature(err.to_string()))?;
        Ok(data.claims)
    }

    fn verify_scope(&self, payload: &SignaturePayload, signing: &SigningConfig) -> Result<(), SignError> {
        if payload.scope != signing.scope {
            return Err(SignError::ErrScopeMismatch {
                found: payload.scope.clone(),
                expected: signing.scope.clone(),
            });
        }
        Ok(())
    }

    /// The envelope's file set must exactly equal the archive's file set
    /// (minus `.signatures.json`), modulo both sides' `exclude_files` (§4.C,
    /// §3 "the set of files in the envelope exactly equals the set of files
    /// in the archive").
    fn verify_file_set(&self, bundle: &Bundle, payload: &SignaturePayload) -> Result<(), SignError> {
        let excluded: BTreeSet<&str> = payload.exclude_files.iter().map(String::as_str).collect();

        let archive_files: BTreeSet<&str> = bundle
            .raw_files
            .keys()
            .map(String::as_str)
            .filter(|p| *p != ".signatures.json" && !excluded.contains(p))
            .collect();
        let envelope_files: BTreeSet<&str> =
            payload.files.iter().map(|f| f.name.as_str()).filter(|p| !excluded.contains(p)).collect();

        if archive_files != envelope_files {
            let missing_from_envelope: Vec<&&str> = archive_files.difference(&envelope_files).collect();
            let missing_from_archive: Vec<&&str> = envelope_files.difference(&archive_files).collect();
            return Err(SignError::ErrFileSetMismatch {
                detail: format!(
                    "in archive but unsigned: {missing_from_envelope:?}; signed but absent from archive: {missing_from_archive:?}"
                ),
            });
        }
        Ok(())
    }

    fn verify_hashes(&self, bundle: &Bundle, payload: &SignaturePayload) -> Result<(), SignError> {
        let excluded: BTreeSet<&str> = payload.exclude_files.iter().map(String::as_str).collect();
        for FileSignature { name, hash, algorithm } in &payload.files {
            if excluded.contains(name.as_str()) {
                continue;
            }
            let Some(raw) = bundle.raw_files.get(name) else {
                // Already caught by `verify_file_set`, but guards against a
                // future caller skipping that step.
                continue;
            };
            let computed = digest_hex(name, raw, *algorithm)
                .map_err(|err| SignError::ErrFileSetMismatch { detail: err.to_string() })?;
            if &computed != hash {
                return Err(SignError::ErrHashMismatch {
                    path: name.clone(),
                    expected: hash.clone(),
                    computed,
                });
            }
        }
        Ok(())
    }
}

impl BundleVerifier for SignatureVerifier {
    fn verify<'a>(&'a self, bundle: &'a Bundle, signing: &'a SigningConfig) -> VerifyFuture<'a> {
        Box::pin(async move { self.verify_with_override(bundle, signing, None).map_err(|err| err.to_string()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_types::{Manifest, SignatureEnvelope};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use std::collections::BTreeMap;

    const SECRET: &str = "test-hmac-secret";

    fn key(name: &str, scope: Option<&str>) -> Key {
        Key {
            name: name.to_string(),
            algorithm: JwsAlgorithm::HS256,
            material: KeyMaterial::Private(SECRET.to_string()),
            scope: scope.map(str::to_string),
        }
    }

    fn sign(payload: &SignaturePayload) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(SECRET.as_bytes());
        encode(&header, payload, &key).unwrap()
    }

    fn bundle_with(raw_files: BTreeMap<String, Vec<u8>>, token: String) -> Bundle {
        Bundle {
            name: "main".to_string(),
            manifest: Manifest {
                revision: "v1".to_string(),
                roots: None,
                rego_version: None,
            },
            modules: vec![],
            data: serde_json::json!({}),
            wasm: vec![],
            signatures: Some(SignatureEnvelope { signatures: vec![token] }),
            raw_files,
        }
    }

    #[test]
    fn verifies_matching_signature_and_hashes() {
        let raw = BTreeMap::from([(".manifest".to_string(), br#"{"revision":"v1"}"#.to_vec())]);
        let hash = digest_hex(".manifest", &raw[".manifest"], HashAlgorithm::Sha256).unwrap();
        let payload = SignaturePayload {
            files: vec![FileSignature {
                name: ".manifest".to_string(),
                hash,
                algorithm: HashAlgorithm::Sha256,
            }],
            scope: Some("write".to_string()),
            keyid: Some("main".to_string()),
            exclude_files: vec![],
        };
        let token = sign(&payload);
        let bundle = bundle_with(raw, token);

        let verifier = SignatureVerifier::new(Keyring::new([key("main", Some("write"))]));
        let signing = SigningConfig {
            keyid: Some("main".to_string()),
            scope: Some("write".to_string()),
            exclude_files: vec![],
        };
        verifier.verify_with_override(&bundle, &signing, None).unwrap();
    }

    #[test]
    fn rejects_missing_signatures() {
        let bundle = Bundle {
            name: "main".to_string(),
            manifest: Manifest {
                revision: "v1".to_string(),
                roots: None,
                rego_version: None,
            },
            modules: vec![],
            data: serde_json::json!({}),
            wasm: vec![],
            signatures: None,
            raw_files: BTreeMap::new(),
        };
        let verifier = SignatureVerifier::new(Keyring::new([key("main", None)]));
        let signing = SigningConfig::default();
        let err = verifier.verify_with_override(&bundle, &signing, None).unwrap_err();
        assert!(matches!(err, SignError::ErrMissingSignatures(_)));
    }

    #[test]
    fn rejects_scope_mismatch() {
        let raw = BTreeMap::from([(".manifest".to_string(), br#"{"revision":"v1"}"#.to_vec())]);
        let hash = digest_hex(".manifest", &raw[".manifest"], HashAlgorithm::Sha256).unwrap();
        let payload = SignaturePayload {
            files: vec![FileSignature {
                name: ".manifest".to_string(),
                hash,
                algorithm: HashAlgorithm::Sha256,
            }],
            scope: Some("read".to_string()),
            keyid: Some("main".to_string()),
            exclude_files: vec![],
        };
        let token = sign(&payload);
        let bundle = bundle_with(raw, token);

        let verifier = SignatureVerifier::new(Keyring::new([key("main", Some("read"))]));
        let signing = SigningConfig {
            keyid: Some("main".to_string()),
            scope: Some("write".to_string()),
            exclude_files: vec![],
        };
        let err = verifier.verify_with_override(&bundle, &signing, None).unwrap_err();
        assert!(matches!(err, SignError::ErrScopeMismatch { .. }));
    }

    #[test]
    fn rejects_hash_mismatch() {
        let raw = BTreeMap::from([(".manifest".to_string(), br#"{"revision":"v1"}"#.to_vec())]);
        let payload = SignaturePayload {
            files: vec![FileSignature {
                name: ".manifest".to_string(),
                hash: "0".repeat(64),
                algorithm: HashAlgorithm::Sha256,
            }],
            scope: None,
            keyid: Some("main".to_string()),
            exclude_files: vec![],
        };
        let token = sign(&payload);
        let bundle = bundle_with(raw, token);

        let verifier = SignatureVerifier::new(Keyring::new([key("main", None)]));
        let err = verifier.verify_with_override(&bundle, &SigningConfig::default(), None).unwrap_err();
        assert!(matches!(err, SignError::ErrHashMismatch { .. }));
    }

    #[test]
    fn rejects_file_set_mismatch() {
        let raw = BTreeMap::from([
            (".manifest".to_string(), br#"{"revision":"v1"}"#.to_vec()),
            ("extra.rego".to_string(), b"package x\n".to_vec()),
        ]);
        let hash = digest_hex(".manifest", &raw[".manifest"], HashAlgorithm::Sha256).unwrap();
        let payload = SignaturePayload {
            files: vec![FileSignature {
                name: ".manifest".to_string(),
                hash,
                algorithm: HashAlgorithm::Sha256,
            }],
            scope: None,
            keyid: Some("main".to_string()),
            exclude_files: vec![],
        };
        let token = sign(&payload);
        let bundle = bundle_with(raw, token);

        let verifier = SignatureVerifier::new(Keyring::new([key("main", None)]));
        let err = verifier.verify_with_override(&bundle, &SigningConfig::default(), None).unwrap_err();
        assert!(matches!(err, SignError::ErrFileSetMismatch { .. }));
    }

    #[test]
    fn exclude_files_are_skipped_on_both_sides() {
        let raw = BTreeMap::from([
            (".manifest".to_string(), br#"{"revision":"v1"}"#.to_vec()),
            ("notes.txt".to_string(), b"not signed".to_vec()),
        ]);
        let hash = digest_hex(".manifest", &raw[".manifest"], HashAlgorithm::Sha256).unwrap();
        let payload = SignaturePayload {
            files: vec![FileSignature {
                name: ".manifest".to_string(),
                hash,
                algorithm: HashAlgorithm::Sha256,
            }],
            scope: None,
            keyid: Some("main".to_string()),
            exclude_files: vec!["notes.txt".to_string()],
        };
        let token = sign(&payload);
        let bundle = bundle_with(raw, token);

        let verifier = SignatureVerifier::new(Keyring::new([key("main", None)]));
        verifier.verify_with_override(&bundle, &SigningConfig::default(), None).unwrap();
    }

    #[test]
    fn override_key_wins_over_configured_keyid() {
        let raw = BTreeMap::from([(".manifest".to_string(), br#"{"revision":"v1"}"#.to_vec())]);
        let hash = digest_hex(".manifest", &raw[".manifest"], HashAlgorithm::Sha256).unwrap();
        let payload = SignaturePayload {
            files: vec![FileSignature {
                name: ".manifest".to_string(),
                hash,
                algorithm: HashAlgorithm::Sha256,
            }],
            scope: None,
            keyid: None,
            exclude_files: vec![],
        };
        let token = sign(&payload);
        let bundle = bundle_with(raw, token);

        let verifier = SignatureVerifier::new(Keyring::new([key("override", None), key("configured", None)]));
        let signing = SigningConfig {
            keyid: Some("configured".to_string()),
            scope: None,
            exclude_files: vec![],
        };
        verifier.verify_with_override(&bundle, &signing, Some("override")).unwrap();
    }
}
