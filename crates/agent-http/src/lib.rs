//! Credentialed HTTP service client (§4.A).
//!
//! A [`ServiceClient`] wraps one configured [`Service`](agent_types::Service):
//! it joins the service's base URL with a caller-supplied suffix, invokes the
//! attached [`CredentialProvider`](agent_auth::CredentialProvider)'s
//! `prepare` hook before every dispatch, and retries network errors and 5xx
//! responses with the shared exponential-backoff policy from `agent-retry`.
//! 4xx responses (other than the conditional-GET special case the bundle
//! downloader handles itself) surface immediately per §4.A "Retries".

use std::time::Duration;

use agent_auth::{AuthError, CredentialProvider, PreparedRequest};
use agent_retry::{ErrorClass, RetryStrategyConfig, calculate_delay};
use agent_types::{AgentError, Service, TlsConfig};
use thiserror::Error;

/// Failure taxonomy for the service client (§4.A).
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("http error: status {status}")]
    Http { status: u16, body: String },

    #[error("tls error: {0}")]
    Tls(String),
}

impl From<HttpError> for AgentError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Network(msg) => AgentError::Network(msg),
            HttpError::Auth(msg) => AgentError::Auth(msg),
            HttpError::Http { status, body } => AgentError::Http { status, message: body },
            HttpError::Tls(msg) => AgentError::Network(msg),
        }
    }
}

impl From<AuthError> for HttpError {
    fn from(err: AuthError) -> Self {
        HttpError::Auth(err.to_string())
    }
}

fn classify(err: &HttpError) -> ErrorClass {
    match err {
        HttpError::Network(_) | HttpError::Tls(_) => ErrorClass::Retryable,
        HttpError::Http { status, .. } if *status >= 500 => ErrorClass::Retryable,
        HttpError::Http { .. } | HttpError::Auth(_) => ErrorClass::Permanent,
    }
}

/// A description of the call to make, relative to the service's base URL.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub suffix: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl RequestSpec {
    pub fn get(suffix: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            suffix: suffix.into(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn post(suffix: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            suffix: suffix.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The response of a [`ServiceClient::do_request`] call.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ServiceResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Join a service's base URL with a caller-supplied suffix (§4.A "final URL
/// is base joined with the caller-supplied suffix").
pub fn join_url(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{suffix}")
    }
}

/// Build the rustls-backed trust pool / client identity reqwest uses for a
/// service's [`TlsConfig`].
fn build_http_client(tls: &TlsConfig) -> Result<reqwest::Client, HttpError> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(tls.allow_insecure_tls);

    if !tls.system_ca {
        builder = builder.tls_built_in_root_certs(false);
    }

    let ca_pem = tls
        .ca_cert
        .clone()
        .or_else(|| tls.ca_cert_env.as_ref().and_then(|v| std::env::var(v).ok()))
        .or_else(|| {
            tls.ca_cert_file
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
        });
    if let Some(pem) = ca_pem {
        let cert = reqwest::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| HttpError::Tls(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    let client_cert_pem = tls
        .client_cert_env
        .as_ref()
        .and_then(|v| std::env::var(v).ok())
        .or_else(|| {
            tls.client_cert_file
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
        });
    let client_key_pem = tls
        .client_key_env
        .as_ref()
        .and_then(|v| std::env::var(v).ok())
        .or_else(|| {
            tls.client_key_file
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
        });
    if let (Some(cert), Some(key)) = (client_cert_pem, client_key_pem) {
        let mut pem = cert;
        pem.push('\n');
        pem.push_str(&key);
        let identity = reqwest::Identity::from_pem(pem.as_bytes())
            .map_err(|e| HttpError::Tls(format!("invalid client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| HttpError::Tls(format!("failed to build HTTP client: {e}")))
}

/// Credentialed HTTP client for a single configured [`Service`].
pub struct ServiceClient {
    http: reqwest::Client,
    service: Service,
    credential: CredentialProvider,
    retry: RetryStrategyConfig,
}

impl ServiceClient {
    pub fn new(
        service: Service,
        credential: CredentialProvider,
        retry: RetryStrategyConfig,
    ) -> Result<Self, HttpError> {
        let http = build_http_client(&service.tls)?;
        Ok(Self {
            http,
            service,
            credential,
            retry,
        })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Issue `request`, applying credentials and retrying retryable failures
    /// (§4.A "Retries").
    pub async fn do_request(&self, request: RequestSpec) -> Result<ServiceResponse, HttpError> {
        let mut attempt = 1;
        loop {
            match self.do_request_once(&request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let class = classify(&err);
                    if class != ErrorClass::Retryable || attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = calculate_delay(&self.retry, attempt);
                    tracing::warn!(
                        service = %self.service.name,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "service client request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn do_request_once(&self, request: &RequestSpec) -> Result<ServiceResponse, HttpError> {
        let url = join_url(&self.service.url, &request.suffix);

        let mut prepared = PreparedRequest::new(request.method.clone(), url.clone());
        for (name, value) in &self.service.headers {
            prepared.set_header(name.clone(), value.clone());
        }
        for (name, value) in &request.headers {
            prepared.set_header(name.clone(), value.clone());
        }
        if let Some(body) = &request.body {
            prepared = prepared.with_body(body.clone());
        }

        self.credential.prepare(&mut prepared).await?;

        let method = reqwest::Method::from_bytes(prepared.method.as_bytes())
            .map_err(|e| HttpError::Network(format!("invalid method {}: {e}", prepared.method)))?;
        let mut builder = self.http.request(method, &prepared.url).timeout(request.timeout);
        for (name, value) in &prepared.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = prepared.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?
            .to_vec();

        if status >= 400 && status != 304 {
            return Err(HttpError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(ServiceResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes_on_either_side() {
        assert_eq!(join_url("https://example.com/", "/bundle"), "https://example.com/bundle");
        assert_eq!(join_url("https://example.com", "bundle"), "https://example.com/bundle");
        assert_eq!(join_url("https://example.com/base", ""), "https://example.com/base");
    }

    #[test]
    fn classify_5xx_is_retryable_4xx_is_not() {
        let server_err = HttpError::Http {
            status: 503,
            body: String::new(),
        };
        let client_err = HttpError::Http {
            status: 404,
            body: String::new(),
        };
        assert_eq!(classify(&server_err), ErrorClass::Retryable);
        assert_eq!(classify(&client_err), ErrorClass::Permanent);
    }

    #[test]
    fn classify_network_and_tls_errors_are_retryable() {
        assert_eq!(classify(&HttpError::Network("timeout".into())), ErrorClass::Retryable);
        assert_eq!(classify(&HttpError::Tls("handshake failed".into())), ErrorClass::Retryable);
    }

    #[tokio::test]
    async fn do_request_against_local_server_returns_body() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let response = tiny_http::Response::from_string("{\"ok\":true}")
                    .with_header("ETag: \"v1\"".parse::<tiny_http::Header>().unwrap());
                let _ = request.respond(response);
            }
        });

        let service = Service {
            name: "test".to_string(),
            url: format!("http://{addr}"),
            headers: Default::default(),
            tls: TlsConfig::default(),
            response_header_timeout_seconds: None,
            credentials: None,
        };
        let client = ServiceClient::new(
            service,
            CredentialProvider::Bearer {
                token: "t".to_string(),
            },
            RetryStrategyConfig {
                max_attempts: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let response = client.do_request(RequestSpec::get("bundle")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("ETag"), Some("\"v1\""));

        handle.join().unwrap();
    }
}
