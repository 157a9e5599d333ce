//! Credential providers for the management-plane agent's service client (§4.A, §9).
//!
//! A [`CredentialProvider`] is a tagged sum: exactly one variant is
//! configured per [`Service`](agent_types::Service), and `prepare` mutates an
//! outbound [`PreparedRequest`] in place — attaching a bearer header,
//! computing a SigV4 signature, or swapping in a cached OAuth2 token. This
//! mirrors the credential-resolution shape the registry client uses for
//! `CARGO_REGISTRY_TOKEN`/`credentials.toml`, generalized to the provider set
//! the spec names instead of being wired to crates.io specifically.

pub mod oauth2;
pub mod sigv4;

use std::collections::HashMap;
use std::sync::Arc;

use agent_types::TlsConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use oauth2::{OAuth2Error, OAuth2Grant, TokenCache};
pub use sigv4::{AwsCredentials, AwsSigningScheme, Sigv4Error, Sigv4Signer, sign_request};

/// Errors surfaced while preparing a request's credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential available: {0}")]
    NoCredential(String),

    #[error("oauth2 token acquisition failed: {0}")]
    OAuth2(#[from] OAuth2Error),

    #[error("sigv4 signing failed: {0}")]
    Sigv4(#[from] Sigv4Error),

    #[error("metadata endpoint {url} returned an error: {detail}")]
    Metadata { url: String, detail: String },

    #[error("custom credential plugin {name:?} failed: {detail}")]
    CustomPlugin { name: String, detail: String },
}

/// The HTTP method/headers/body view a credential provider can mutate before
/// the service client dispatches the request (§4.A `Prepare(request)`).
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl PreparedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }
}

/// AWS S3-signing sub-variants (§4.A `s3_signing`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Sigv4CredentialSource {
    Environment,
    NamedProfile { profile: String },
    Ec2Metadata,
    EcsMetadata,
    WebIdentity {
        role_arn: String,
        token_file: String,
    },
}

/// Configuration for the `oauth2_client_credentials`/`oauth2_jwt_bearer`/
/// `oauth2_client_credentials_jwt` providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Seconds subtracted from a token's reported expiry before it is
    /// considered stale, so refreshes happen ahead of the deadline.
    #[serde(default = "default_skew_seconds")]
    pub expiry_skew_seconds: u64,
    /// Required for `oauth2_jwt_bearer`/`oauth2_client_credentials_jwt`: the
    /// signing key used to mint the bearer assertion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

fn default_skew_seconds() -> u64 {
    10
}

/// The tagged credential-provider set (§4.A, §9 "dynamic dispatch on
/// credential providers"). Each variant owns its own refreshable state
/// rather than participating in an inheritance hierarchy.
#[derive(Clone)]
pub enum CredentialProvider {
    Bearer {
        token: String,
    },
    ClientTls {
        tls: TlsConfig,
    },
    OAuth2ClientCredentials {
        config: OAuth2Config,
        cache: Arc<TokenCache>,
    },
    OAuth2JwtBearer {
        config: OAuth2Config,
        cache: Arc<TokenCache>,
    },
    OAuth2ClientCredentialsJwt {
        config: OAuth2Config,
        cache: Arc<TokenCache>,
    },
    S3Signing {
        source: Sigv4CredentialSource,
        region: String,
        service: String,
        scheme: AwsSigningScheme,
    },
    GcpMetadata {
        metadata_url: String,
    },
    AzureManagedIdentity {
        resource: String,
        client_id: Option<String>,
    },
    CustomPlugin {
        name: String,
    },
    /// No credential provider configured for this service: requests go out
    /// unauthenticated. Distinct from the other variants rather than
    /// defaulting to an empty bearer token, which would attach a bogus
    /// `Authorization: Bearer ` header.
    None,
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            CredentialProvider::Bearer { .. } => "bearer",
            CredentialProvider::ClientTls { .. } => "client_tls",
            CredentialProvider::OAuth2ClientCredentials { .. } => "oauth2_client_credentials",
            CredentialProvider::OAuth2JwtBearer { .. } => "oauth2_jwt_bearer",
            CredentialProvider::OAuth2ClientCredentialsJwt { .. } => {
                "oauth2_client_credentials_jwt"
            }
            CredentialProvider::S3Signing { .. } => "s3_signing",
            CredentialProvider::GcpMetadata { .. } => "gcp_metadata",
            CredentialProvider::AzureManagedIdentity { .. } => "azure_managed_identity",
            CredentialProvider::CustomPlugin { .. } => "custom_plugin",
            CredentialProvider::None => "none",
        };
        f.debug_struct("CredentialProvider").field("kind", &tag).finish()
    }
}

impl CredentialProvider {
    /// Mutate `request` in place, attaching whatever headers or signature
    /// this provider contributes. Async because OAuth2/metadata-endpoint
    /// variants may need to perform (and cache) a network round trip.
    pub async fn prepare(&self, request: &mut PreparedRequest) -> Result<(), AuthError> {
        match self {
            CredentialProvider::Bearer { token } => {
                request.set_header("Authorization", format!("Bearer {token}"));
                Ok(())
            }
            CredentialProvider::ClientTls { .. } => {
                // Client certificate is attached at the transport layer by
                // agent-http's TLS trust pool; nothing to add at the
                // request-header level.
                Ok(())
            }
            CredentialProvider::OAuth2ClientCredentials { config, cache }
            | CredentialProvider::OAuth2JwtBearer { config, cache }
            | CredentialProvider::OAuth2ClientCredentialsJwt { config, cache } => {
                let grant = oauth2_grant_for(self);
                let token = cache.get_or_refresh(config, grant).await?;
                request.set_header("Authorization", format!("Bearer {}", token.access_token));
                Ok(())
            }
            CredentialProvider::S3Signing {
                source,
                region,
                service,
                scheme,
            } => {
                let credentials = sigv4::resolve_credentials(source)
                    .await
                    .map_err(AuthError::Sigv4)?;
                let signer = Sigv4Signer::new(credentials, region.clone(), service.clone(), *scheme);
                signer.sign(request).map_err(AuthError::Sigv4)
            }
            CredentialProvider::GcpMetadata { metadata_url } => {
                let token = fetch_metadata_token(metadata_url).await?;
                request.set_header("Authorization", format!("Bearer {token}"));
                Ok(())
            }
            CredentialProvider::AzureManagedIdentity {
                resource,
                client_id,
            } => {
                let url = azure_metadata_url(resource, client_id.as_deref());
                let token = fetch_metadata_token(&url).await?;
                request.set_header("Authorization", format!("Bearer {token}"));
                Ok(())
            }
            CredentialProvider::CustomPlugin { name } => Err(AuthError::CustomPlugin {
                name: name.clone(),
                detail: "no plugin registered for this name".to_string(),
            }),
            CredentialProvider::None => Ok(()),
        }
    }
}

/// The on-the-wire shape of a `services[].credentials` block: the same tags
/// as [`CredentialProvider`] but deserializable, since the live provider
/// carries non-serializable runtime state (an `Arc<TokenCache>`) that gets
/// constructed fresh on `resolve`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
enum RawCredentialConfig {
    Bearer {
        token: String,
    },
    ClientTls {
        #[serde(default)]
        tls: TlsConfig,
    },
    Oauth2ClientCredentials {
        #[serde(flatten)]
        config: OAuth2Config,
    },
    Oauth2JwtBearer {
        #[serde(flatten)]
        config: OAuth2Config,
    },
    Oauth2ClientCredentialsJwt {
        #[serde(flatten)]
        config: OAuth2Config,
    },
    S3Signing {
        source: Sigv4CredentialSource,
        region: String,
        #[serde(default = "default_s3_service")]
        service: String,
        #[serde(default)]
        scheme: AwsSigningScheme,
    },
    GcpMetadata {
        #[serde(default = "default_gcp_metadata_url")]
        metadata_url: String,
    },
    AzureManagedIdentity {
        resource: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    CustomPlugin {
        name: String,
    },
}

fn default_s3_service() -> String {
    "s3".to_string()
}

fn default_gcp_metadata_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token".to_string()
}

impl Default for AwsSigningScheme {
    fn default() -> Self {
        AwsSigningScheme::Sigv4
    }
}

/// Resolve a `services[].credentials` config fragment into a live
/// [`CredentialProvider`] (§9 "dynamic dispatch on credential providers").
/// Exactly one provider may be configured per service, so the caller passes
/// the whole `credentials` value and gets back the one variant it names.
pub fn resolve(value: &serde_json::Value) -> Result<CredentialProvider, AuthError> {
    let raw: RawCredentialConfig = serde_json::from_value(value.clone())
        .map_err(|err| AuthError::NoCredential(format!("invalid credentials block: {err}")))?;

    Ok(match raw {
        RawCredentialConfig::Bearer { token } => CredentialProvider::Bearer { token },
        RawCredentialConfig::ClientTls { tls } => CredentialProvider::ClientTls { tls },
        RawCredentialConfig::Oauth2ClientCredentials { config } => CredentialProvider::OAuth2ClientCredentials {
            config,
            cache: TokenCache::new(),
        },
        RawCredentialConfig::Oauth2JwtBearer { config } => CredentialProvider::OAuth2JwtBearer {
            config,
            cache: TokenCache::new(),
        },
        RawCredentialConfig::Oauth2ClientCredentialsJwt { config } => CredentialProvider::OAuth2ClientCredentialsJwt {
            config,
            cache: TokenCache::new(),
        },
        RawCredentialConfig::S3Signing {
            source,
            region,
            service,
            scheme,
        } => CredentialProvider::S3Signing {
            source,
            region,
            service,
            scheme,
        },
        RawCredentialConfig::GcpMetadata { metadata_url } => CredentialProvider::GcpMetadata { metadata_url },
        RawCredentialConfig::AzureManagedIdentity { resource, client_id } => {
            CredentialProvider::AzureManagedIdentity { resource, client_id }
        }
        RawCredentialConfig::CustomPlugin { name } => CredentialProvider::CustomPlugin { name },
    })
}

fn oauth2_grant_for(provider: &CredentialProvider) -> OAuth2Grant {
    match provider {
        CredentialProvider::OAuth2ClientCredentials { .. } => OAuth2Grant::ClientCredentials,
        CredentialProvider::OAuth2JwtBearer { .. } => OAuth2Grant::JwtBearer,
        CredentialProvider::OAuth2ClientCredentialsJwt { .. } => {
            OAuth2Grant::ClientCredentialsJwt
        }
        _ => unreachable!("oauth2_grant_for called on a non-OAuth2 provider"),
    }
}

fn azure_metadata_url(resource: &str, client_id: Option<&str>) -> String {
    let mut url = format!(
        "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource={resource}"
    );
    if let Some(client_id) = client_id {
        url.push_str(&format!("&client_id={client_id}"));
    }
    url
}

/// Shared ambient HTTP fetch used by the GCP/Azure metadata-endpoint
/// variants; a single-flight cache is unnecessary here because the instance
/// metadata service is local and returns in microseconds.
async fn fetch_metadata_token(url: &str) -> Result<String, AuthError> {
    #[derive(Deserialize)]
    struct MetadataTokenResponse {
        access_token: String,
    }

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .header("Metadata-Flavor", "Google")
        .header("Metadata", "true")
        .send()
        .await
        .map_err(|e| AuthError::Metadata {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(AuthError::Metadata {
            url: url.to_string(),
            detail: format!("status {}", response.status()),
        });
    }

    let parsed: MetadataTokenResponse =
        response.json().await.map_err(|e| AuthError::Metadata {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

    Ok(parsed.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bearer_provider_sets_authorization_header() {
        let provider = CredentialProvider::Bearer {
            token: "abc123".to_string(),
        };
        let mut request = PreparedRequest::new("GET", "https://example.com/bundle");
        provider.prepare(&mut request).await.unwrap();
        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Bearer abc123".to_string())
        );
    }

    #[tokio::test]
    async fn client_tls_provider_leaves_headers_untouched() {
        let provider = CredentialProvider::ClientTls {
            tls: TlsConfig::default(),
        };
        let mut request = PreparedRequest::new("GET", "https://example.com/bundle");
        provider.prepare(&mut request).await.unwrap();
        assert!(request.headers.is_empty());
    }

    #[tokio::test]
    async fn custom_plugin_without_registration_errors() {
        let provider = CredentialProvider::CustomPlugin {
            name: "vault-signer".to_string(),
        };
        let mut request = PreparedRequest::new("GET", "https://example.com/bundle");
        let err = provider.prepare(&mut request).await.unwrap_err();
        assert!(matches!(err, AuthError::CustomPlugin { name, .. } if name == "vault-signer"));
    }

    #[test]
    fn debug_impl_reports_variant_tag_not_secrets() {
        let provider = CredentialProvider::Bearer {
            token: "super-secret".to_string(),
        };
        let rendered = format!("{provider:?}");
        assert!(rendered.contains("bearer"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn resolve_builds_bearer_provider_from_tagged_json() {
        let value = serde_json::json!({"type": "bearer", "token": "xyz"});
        let provider = resolve(&value).unwrap();
        assert!(matches!(provider, CredentialProvider::Bearer { token } if token == "xyz"));
    }

    #[test]
    fn resolve_builds_s3_signing_provider_with_defaults() {
        let value = serde_json::json!({
            "type": "s3_signing",
            "source": {"type": "environment"},
            "region": "us-east-1",
        });
        let provider = resolve(&value).unwrap();
        assert!(matches!(
            provider,
            CredentialProvider::S3Signing { service, scheme, .. }
                if service == "s3" && scheme == AwsSigningScheme::Sigv4
        ));
    }

    #[test]
    fn resolve_rejects_unknown_shape() {
        let value = serde_json::json!({"type": "not_a_real_provider"});
        assert!(resolve(&value).is_err());
    }
}
