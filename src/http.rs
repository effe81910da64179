use rand::seq::IndexedRandom;
use std::fmt;
use std::io::Read;
use std::time::Duration;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:126.0) Gecko/20100101 Firefox/126.0",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    /// Set for downloads: `timeout` then covers connect and response headers
    /// only, and the whole body must arrive within this budget.
    pub body_timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout,
            body_timeout: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn streaming(mut self, body_timeout: Duration) -> Self {
        self.body_timeout = Some(body_timeout);
        self
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Box<dyn Read>,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The endpoint is unusable (refused, CONNECT failed, DNS, TLS).
    Hard,
    /// The endpoint is slow; tolerated a few times in a row.
    Soft,
    /// The request itself is malformed; no endpoint is to blame.
    Request,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failure: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

pub trait Transport: Send + Sync {
    fn get(
        &self,
        request: &HttpRequest,
        proxy: Option<&str>,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

#[derive(Debug, Default, Clone)]
pub struct UreqTransport;

impl UreqTransport {
    fn build_agent(
        &self,
        request: &HttpRequest,
        proxy: Option<&str>,
    ) -> std::result::Result<ureq::Agent, TransportError> {
        let proxy = match proxy {
            Some(raw) => Some(ureq::Proxy::new(raw).map_err(|e| {
                TransportError::new(FailureKind::Hard, format!("invalid proxy {raw}: {e}"))
            })?),
            None => None,
        };

        let timeout = Some(request.timeout.max(Duration::from_secs(1)));
        let mut config = ureq::Agent::config_builder();
        config = config
            .http_status_as_error(false)
            .user_agent(random_user_agent())
            .proxy(proxy);
        config = match request.body_timeout {
            Some(body) => config
                .timeout_connect(timeout)
                .timeout_recv_response(timeout)
                .timeout_recv_body(Some(body.max(Duration::from_secs(1)))),
            None => config.timeout_global(timeout),
        };
        Ok(config.build().into())
    }
}

impl Transport for UreqTransport {
    fn get(
        &self,
        request: &HttpRequest,
        proxy: Option<&str>,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let agent = self.build_agent(request, proxy)?;
        let mut call = agent.get(&request.url);
        for (name, value) in &request.headers {
            call = call.header(name.as_str(), value.as_str());
        }

        let response = call
            .call()
            .map_err(|err| TransportError::new(classify_ureq_error(&err), err.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        Ok(HttpResponse {
            status,
            retry_after,
            body: Box::new(response.into_body().into_reader()),
        })
    }
}

fn classify_ureq_error(err: &ureq::Error) -> FailureKind {
    match err {
        ureq::Error::Timeout(_) => FailureKind::Soft,
        ureq::Error::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) =>
        {
            FailureKind::Soft
        }
        ureq::Error::BadUri(_) | ureq::Error::Http(_) => FailureKind::Request,
        _ => FailureKind::Hard,
    }
}

/// True when a body read failed because the transfer stalled past its budget.
pub fn is_body_timeout(err: &std::io::Error) -> bool {
    if matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<ureq::Error>())
        .is_some_and(|inner| classify_ureq_error(inner) == FailureKind::Soft)
}

/// Parses a delay-seconds `Retry-After`. Values that do not fit a `Duration`
/// are dropped; callers cap what remains.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}
