//! OAuth2 token acquisition and caching (§4.A, §5 "OAuth2 token cache is
//! per-service; refreshes are single-flighted via a per-service mutex").

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::OAuth2Config;

#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("token endpoint request failed: {0}")]
    Request(String),

    #[error("token endpoint returned {status}: {body}")]
    ErrorResponse { status: u16, body: String },

    #[error("oauth2_jwt_bearer/oauth2_client_credentials_jwt requires a signing_key")]
    MissingSigningKey,

    #[error("failed to mint JWT assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Which grant the cached token was (or will be) acquired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuth2Grant {
    ClientCredentials,
    JwtBearer,
    ClientCredentialsJwt,
}

/// A cached access token plus the instant after which it is considered
/// stale and must be refreshed.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_stale(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Serialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Per-service token cache. A held lock on `inflight` means a refresh is
/// already underway; concurrent callers wait on the same future rather than
/// issuing a second token request (single-flight, §5).
#[derive(Debug, Default)]
pub struct TokenCache {
    inflight: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get_or_refresh(
        &self,
        config: &OAuth2Config,
        grant: OAuth2Grant,
    ) -> Result<CachedToken, OAuth2Error> {
        let mut guard = self.inflight.lock().await;
        if let Some(cached) = guard.as_ref()
            && !cached.is_stale()
        {
            return Ok(cached.clone());
        }

        let fresh = request_token(config, grant).await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }
}

async fn request_token(
    config: &OAuth2Config,
    grant: OAuth2Grant,
) -> Result<CachedToken, OAuth2Error> {
    let client = reqwest::Client::new();
    let mut form: Vec<(&str, String)> = Vec::new();

    match grant {
        OAuth2Grant::ClientCredentials => {
            form.push(("grant_type", "client_credentials".to_string()));
            form.push(("client_id", config.client_id.clone()));
            if let Some(secret) = &config.client_secret {
                form.push(("client_secret", secret.clone()));
            }
        }
        OAuth2Grant::JwtBearer => {
            let assertion = mint_jwt_assertion(config)?;
            form.push((
                "grant_type",
                "urn:ietf:params:oauth:grant-type:jwt-bearer".to_string(),
            ));
            form.push(("assertion", assertion));
        }
        OAuth2Grant::ClientCredentialsJwt => {
            let assertion = mint_jwt_assertion(config)?;
            form.push(("grant_type", "client_credentials".to_string()));
            form.push((
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
            ));
            form.push(("client_assertion", assertion));
        }
    }

    if !config.scopes.is_empty() {
        form.push(("scope", config.scopes.join(" ")));
    }

    let response = client
        .post(&config.token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| OAuth2Error::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuth2Error::ErrorResponse {
            status: status.as_u16(),
            body,
        });
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| OAuth2Error::Request(e.to_string()))?;

    let skew = Duration::from_secs(config.expiry_skew_seconds);
    let ttl = Duration::from_secs(parsed.expires_in).saturating_sub(skew);

    Ok(CachedToken {
        access_token: parsed.access_token,
        expires_at: Instant::now() + ttl,
    })
}

fn mint_jwt_assertion(config: &OAuth2Config) -> Result<String, OAuth2Error> {
    let signing_key = config
        .signing_key
        .as_ref()
        .ok_or(OAuth2Error::MissingSigningKey)?;

    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        iss: config.client_id.clone(),
        sub: config.client_id.clone(),
        aud: config.token_url.clone(),
        iat: now,
        exp: now + 300,
    };

    let header = Header::new(Algorithm::RS256);
    let key = EncodingKey::from_rsa_pem(signing_key.as_bytes())?;
    Ok(encode(&header, &claims, &key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_returns_same_token_while_fresh() {
        let cache = TokenCache::new();
        {
            let mut guard = cache.inflight.lock().await;
            *guard = Some(CachedToken {
                access_token: "cached-token".to_string(),
                expires_at: Instant::now() + Duration::from_secs(60),
            });
        }

        let config = OAuth2Config {
            token_url: "https://auth.example.com/token".to_string(),
            client_id: "client".to_string(),
            client_secret: Some("secret".to_string()),
            scopes: vec![],
            expiry_skew_seconds: 10,
            signing_key: None,
        };

        let token = cache
            .get_or_refresh(&config, OAuth2Grant::ClientCredentials)
            .await
            .expect("cached token should be returned without a network call");
        assert_eq!(token.access_token, "cached-token");
    }

    #[test]
    fn jwt_bearer_without_signing_key_errors() {
        let config = OAuth2Config {
            token_url: "https://auth.example.com/token".to_string(),
            client_id: "client".to_string(),
            client_secret: None,
            scopes: vec![],
            expiry_skew_seconds: 10,
            signing_key: None,
        };
        let err = mint_jwt_assertion(&config).unwrap_err();
        assert!(matches!(err, OAuth2Error::MissingSigningKey));
    }
}
