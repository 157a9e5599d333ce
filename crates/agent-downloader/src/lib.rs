//! Single-bundle polling loop (§4.E Downloader).
//!
//! A [`Downloader`] polls one configured resource on a timer (`periodic`) or
//! waits for an explicit [`Downloader::trigger`] call (`manual`), issuing
//! conditional GETs with `If-None-Match` and, when configured, a long-poll
//! `Prefer: wait=<seconds>` header. On `200 OK` it hands the body to an
//! [`Activator`] supplied by the owning plugin (the bundle plugin or the
//! discovery plugin) — this crate knows nothing about bundle parsing or
//! store activation, only about *when* to fetch and *how* to back off.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_http::{HttpError, RequestSpec, ServiceClient};
use agent_retry::downloader_backoff;
use agent_types::{BundleStatus, TriggerMode};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("http error: {0}")]
    Http(#[from] HttpError),
}

/// Polling parameters (§4.E, §6 `polling{min,max,long_poll?}`).
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub long_poll_timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(120),
            long_poll_timeout: None,
        }
    }
}

/// Response-header timeout budget added on top of the long-poll wait, so the
/// HTTP-layer deadline always exceeds the server's hold time (§9 Open
/// Question "long-poll timeout semantics": "the HTTP-layer deadline = long
/// poll_timeout_seconds + response_header_timeout_seconds").
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// A future returned by [`Activator::activate`], boxed for object-safety.
pub type ActivateFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Supplied by the owning plugin: what to do with a freshly downloaded
/// bundle body (§4.E step 4 "hand the bundle to the owning plugin's
/// `Activate(candidate)`"). An `Err` means the candidate was rejected (e.g.
/// root overlap, signature failure) — the downloader keeps its prior etag
/// so the next poll re-fetches and re-attempts the same bytes.
pub trait Activator: Send + Sync {
    fn activate<'a>(&'a self, body: Vec<u8>, etag: Option<&'a str>) -> ActivateFuture<'a>;
}

/// Outcome of a single poll cycle, used by tests and by callers that want to
/// observe activity without reading [`Downloader::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    NotModified,
    Activated,
    ActivationRejected,
}

/// Single-bundle polling downloader (§4.E).
pub struct Downloader {
    name: String,
    client: Arc<ServiceClient>,
    resource: String,
    poll: PollConfig,
    trigger_mode: TriggerMode,
    cancellation: CancellationToken,
    manual_trigger: Notify,
    etag: Mutex<Option<String>>,
    status: Mutex<BundleStatus>,
}

impl Downloader {
    pub fn new(
        name: impl Into<String>,
        client: Arc<ServiceClient>,
        resource: impl Into<String>,
        poll: PollConfig,
        trigger_mode: TriggerMode,
        cancellation: CancellationToken,
    ) -> Self {
        let name = name.into();
        Self {
            status: Mutex::new(BundleStatus {
                name: name.clone(),
                ..Default::default()
            }),
            name,
            client,
            resource: resource.into(),
            poll,
            trigger_mode,
            cancellation,
            manual_trigger: Notify::new(),
            etag: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Trigger()`: wakes a manual-mode downloader (or an early poll in
    /// periodic mode); a no-op if no poll is currently awaiting it.
    pub fn trigger(&self) {
        self.manual_trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn status(&self) -> BundleStatus {
        self.status.lock().expect("lock poisoned").clone()
    }

    /// Seed the etag a downloader should treat as already-activated, used
    /// when a bundle was recovered from on-disk persistence (§4.F) rather
    /// than freshly downloaded, so the next poll still issues a conditional
    /// GET instead of re-activating an identical body.
    pub fn seed_etag(&self, etag: Option<String>) {
        *self.etag.lock().expect("lock poisoned") = etag;
    }

    /// Run the poll loop until cancelled. Each cycle waits for the next
    /// tick (`periodic`) or an explicit [`Downloader::trigger`] call
    /// (`manual`), per §4.E step 1.
    pub async fn run(self: Arc<Self>, activator: Arc<dyn Activator>) {
        let mut delay = self.poll.min_delay;

        loop {
            if self.cancellation.is_cancelled() {
                return;
            }

            match self.trigger_mode {
                TriggerMode::Periodic => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.manual_trigger.notified() => {}
                        _ = self.cancellation.cancelled() => return,
                    }
                }
                TriggerMode::Manual => {
                    tokio::select! {
                        _ = self.manual_trigger.notified() => {}
                        _ = self.cancellation.cancelled() => return,
                    }
                }
            }

            if self.cancellation.is_cancelled() {
                return;
            }

            match self.poll_once(activator.as_ref()).await {
                Ok(_) => delay = self.poll.min_delay,
                Err(err) => {
                    tracing::warn!(bundle = %self.name, error = %err, "downloader poll failed");
                    delay = downloader_backoff(delay, self.poll.min_delay, self.poll.max_delay);
                }
            }
        }
    }

    /// One poll cycle (§4.E steps 2-6). Exposed directly so callers that
    /// drive their own scheduling (e.g. tests, or a discovery plugin
    /// reusing the conditional-GET machinery) can invoke it without the
    /// background loop.
    pub async fn poll_once(&self, activator: &dyn Activator) -> Result<PollOutcome, DownloaderError> {
        let mut request = RequestSpec::get(self.resource.clone());

        if let Some(etag) = self.etag.lock().expect("lock poisoned").clone() {
            request = request.with_header("If-None-Match", etag);
        }

        let timeout = match self.poll.long_poll_timeout {
            Some(wait) => {
                request = request.with_header("Prefer", format!("wait={}", wait.as_secs()));
                wait + DEFAULT_RESPONSE_HEADER_TIMEOUT
            }
            None => DEFAULT_RESPONSE_HEADER_TIMEOUT,
        };
        request = request.with_timeout(timeout);

        {
            let mut status = self.status.lock().expect("lock poisoned");
            status.last_request = Some(Utc::now());
        }

        let response = self.client.do_request(request).await?;

        if response.status == 304 {
            let mut status = self.status.lock().expect("lock poisoned");
            status.last_successful_request = Some(Utc::now());
            status.code = None;
            status.message = None;
            return Ok(PollOutcome::NotModified);
        }

        let new_etag = response.header("ETag").map(|s| s.to_string());
        {
            let mut status = self.status.lock().expect("lock poisoned");
            status.last_successful_request = Some(Utc::now());
            status.last_successful_download = Some(Utc::now());
        }

        match activator.activate(response.body, new_etag.as_deref()).await {
            Ok(()) => {
                *self.etag.lock().expect("lock poisoned") = new_etag;
                let mut status = self.status.lock().expect("lock poisoned");
                status.last_successful_activation = Some(Utc::now());
                status.code = None;
                status.message = None;
                Ok(PollOutcome::Activated)
            }
            Err(reason) => {
                let mut status = self.status.lock().expect("lock poisoned");
                status.code = Some("bundle_error".to_string());
                status.message = Some(reason);
                Ok(PollOutcome::ActivationRejected)
            }
        }
    }
}
