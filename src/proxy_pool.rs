use crate::control::Control;
use crate::http::{FailureKind, HttpRequest, HttpResponse, Transport, TransportError};
use crate::proxies;
use crate::status::StatusSink;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_SOFT_FAILURES: u32 = 5;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 3;
const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("direct request to {url} failed: {reason}")]
    Direct { url: String, reason: String },

    #[error("all proxies failed for {url}")]
    AllProxiesFailed { url: String },

    #[error("request to {url} is invalid: {reason}")]
    Request { url: String, reason: String },

    #[error("http {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("still rate limited on {url} after {retries} retries")]
    RateLimited { url: String, retries: u32 },

    #[error("stop requested")]
    Stopped,
}

enum AttemptError {
    Transport(TransportError),
    Status(u16),
    RateLimited(u32),
    Stopped,
}

/// Round-robin proxy rotation with failover.
///
/// A hard failure (refused, CONNECT failed) evicts the proxy on the spot. A
/// soft failure (timeout) only counts against it; the proxy is evicted after
/// `max_soft_failures` consecutive timeouts. Evictions are written back to the
/// proxy file.
#[derive(Debug)]
pub struct ProxyPool {
    enabled: bool,
    proxies: Vec<String>,
    index: usize,
    failure_counts: HashMap<String, u32>,
    max_soft_failures: u32,
    retry_after_default: Duration,
    max_retry_after: Duration,
    max_rate_limit_retries: u32,
    persist_path: Option<PathBuf>,
    last_proxy: Option<String>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>, enabled: bool) -> Self {
        let failure_counts = proxies.iter().map(|p| (p.clone(), 0)).collect();
        Self {
            enabled,
            proxies,
            index: 0,
            failure_counts,
            max_soft_failures: DEFAULT_MAX_SOFT_FAILURES,
            retry_after_default: DEFAULT_RETRY_AFTER,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            persist_path: None,
            last_proxy: None,
        }
    }

    pub fn direct() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn with_persist_path(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        self
    }

    pub fn with_max_soft_failures(mut self, max: u32) -> Self {
        self.max_soft_failures = max.max(1);
        self
    }

    pub fn with_rate_limit(mut self, retry_after_default: Duration, max_retries: u32) -> Self {
        self.retry_after_default = retry_after_default;
        self.max_rate_limit_retries = max_retries;
        self
    }

    /// Upper bound on a single 429 back-off, whatever `Retry-After` says.
    pub fn with_max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    pub fn failure_count(&self, proxy: &str) -> u32 {
        self.failure_counts.get(proxy).copied().unwrap_or(0)
    }

    /// Runs `request` directly or through the rotation, depending on configuration.
    ///
    /// With proxies enabled but every proxy evicted, requests go out directly.
    pub fn fetch(
        &mut self,
        transport: &dyn Transport,
        request: &HttpRequest,
        control: &Control,
        status: &StatusSink,
    ) -> Result<HttpResponse, FetchError> {
        self.last_proxy = None;
        if !self.enabled || self.proxies.is_empty() {
            return self.fetch_direct(transport, request, control);
        }

        let mut attempts = 0_usize;
        let mut budget = self.proxies.len();
        while attempts < budget && !self.proxies.is_empty() {
            if control.is_stopped() {
                return Err(FetchError::Stopped);
            }

            self.index %= self.proxies.len();
            let proxy = self.proxies[self.index].clone();
            debug!(
                proxy = %proxy,
                position = self.index + 1,
                total = self.proxies.len(),
                "attempting request via proxy"
            );

            match self.send(transport, request, Some(&proxy), control) {
                Ok(response) => {
                    self.mark_healthy(&proxy);
                    self.advance();
                    self.last_proxy = Some(proxy);
                    return Ok(response);
                }
                Err(AttemptError::Status(code)) => {
                    // The proxy delivered an answer; the refusal is the server's.
                    self.mark_healthy(&proxy);
                    self.advance();
                    return Err(FetchError::Status {
                        url: request.url.clone(),
                        status: code,
                    });
                }
                Err(AttemptError::RateLimited(retries)) => {
                    return Err(FetchError::RateLimited {
                        url: request.url.clone(),
                        retries,
                    });
                }
                Err(AttemptError::Stopped) => return Err(FetchError::Stopped),
                Err(AttemptError::Transport(err)) => match err.kind {
                    FailureKind::Request => {
                        return Err(FetchError::Request {
                            url: request.url.clone(),
                            reason: err.message,
                        });
                    }
                    FailureKind::Hard => {
                        error!(proxy = %proxy, reason = %err.message, "proxy is dead; removing");
                        status.warn(format!("Dead proxy removed: {proxy}"));
                        self.remove_proxy(&proxy);
                        budget = self.proxies.len();
                        attempts = 0;
                        continue;
                    }
                    FailureKind::Soft => {
                        if self.record_soft_failure(&proxy, &err.message, status) {
                            budget = self.proxies.len();
                            attempts = 0;
                        } else {
                            self.advance();
                        }
                    }
                },
            }
            attempts += 1;
        }

        error!(url = %request.url, "all proxies failed");
        status.error("All proxies failed. Check console/logs.");
        Err(FetchError::AllProxiesFailed {
            url: request.url.clone(),
        })
    }

    fn fetch_direct(
        &self,
        transport: &dyn Transport,
        request: &HttpRequest,
        control: &Control,
    ) -> Result<HttpResponse, FetchError> {
        if self.enabled {
            warn!(url = %request.url, "proxy pool is empty; sending request directly");
        }
        match self.send(transport, request, None, control) {
            Ok(response) => Ok(response),
            Err(AttemptError::Status(code)) => Err(FetchError::Status {
                url: request.url.clone(),
                status: code,
            }),
            Err(AttemptError::RateLimited(retries)) => Err(FetchError::RateLimited {
                url: request.url.clone(),
                retries,
            }),
            Err(AttemptError::Stopped) => Err(FetchError::Stopped),
            Err(AttemptError::Transport(err)) => {
                error!(url = %request.url, reason = %err.message, "direct request failed");
                Err(FetchError::Direct {
                    url: request.url.clone(),
                    reason: err.message,
                })
            }
        }
    }

    /// One logical request on one route, absorbing 429 responses.
    fn send(
        &self,
        transport: &dyn Transport,
        request: &HttpRequest,
        proxy: Option<&str>,
        control: &Control,
    ) -> Result<HttpResponse, AttemptError> {
        let mut retries = 0_u32;
        loop {
            let response = transport
                .get(request, proxy)
                .map_err(AttemptError::Transport)?;

            if response.status == 429 {
                if retries >= self.max_rate_limit_retries {
                    return Err(AttemptError::RateLimited(retries));
                }
                let wait = response
                    .retry_after
                    .unwrap_or(self.retry_after_default)
                    .min(self.max_retry_after);
                warn!(url = %request.url, wait_secs = wait.as_secs_f64(), "rate limited; backing off");
                if control.wait(wait) {
                    return Err(AttemptError::Stopped);
                }
                retries += 1;
                continue;
            }

            if response.status >= 400 {
                return Err(AttemptError::Status(response.status));
            }
            return Ok(response);
        }
    }

    /// Counts a body that stalled after a successful `fetch` against the proxy
    /// that served it. Direct requests are not tracked.
    pub fn report_stalled_transfer(&mut self, reason: &str, status: &StatusSink) {
        if let Some(proxy) = self.last_proxy.take() {
            if self.proxies.contains(&proxy) {
                self.record_soft_failure(&proxy, reason, status);
            }
        }
    }

    /// Returns true when the proxy hit the limit and was evicted.
    fn record_soft_failure(&mut self, proxy: &str, reason: &str, status: &StatusSink) -> bool {
        let count = self.failure_counts.entry(proxy.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        warn!(
            proxy = %proxy,
            reason = %reason,
            "proxy timed out ({count}/{} consecutive soft failures)",
            self.max_soft_failures
        );
        if count < self.max_soft_failures {
            return false;
        }
        error!(proxy = %proxy, "proxy exceeded soft failure limit; removing");
        status.warn(format!("Removing slow proxy: {proxy}"));
        self.remove_proxy(proxy);
        true
    }

    fn mark_healthy(&mut self, proxy: &str) {
        if let Some(count) = self.failure_counts.get_mut(proxy) {
            if *count > 0 {
                info!(proxy = %proxy, "proxy succeeded; resetting failure count");
                *count = 0;
            }
        }
    }

    fn advance(&mut self) {
        if !self.proxies.is_empty() {
            self.index = (self.index + 1) % self.proxies.len();
        }
    }

    fn remove_proxy(&mut self, proxy: &str) {
        let Some(pos) = self.proxies.iter().position(|p| p == proxy) else {
            return;
        };
        let removed = self.proxies.remove(pos);
        if pos < self.index {
            self.index -= 1;
        }
        if self.index >= self.proxies.len() {
            self.index = 0;
        }
        self.failure_counts.remove(&removed);
        if let Some(path) = self.persist_path.as_deref() {
            if let Err(e) = proxies::save_proxies(path, &self.proxies) {
                error!(error = %e, "failed to persist proxy list");
            }
        }
    }
}
