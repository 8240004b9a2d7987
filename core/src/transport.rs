//! Network transport, timeout and retry.
//!
//! # Design
//! `Transport` is the only seam that performs I/O: it takes an `HttpRequest`
//! and returns whatever the server said, or a `Network`/`Timeout` error if it
//! said nothing. `TransportClient` sits on top and owns the policy: the
//! per-call timeout, status classification (401/403 become `Auth`), and
//! retries. Read-class requests are retried with bounded exponential backoff
//! on network errors, timeouts and 5xx. Write-class requests are sent exactly
//! once.
//!
//! Session credentials live in a cookie store owned by the external session
//! manager. The transport only decides whether to attach them; header values
//! are never logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use tracing::{debug, debug_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{ApiError, ApiResult};
use crate::http::{HttpRequest, HttpResponse, RequestClass};
use crate::validate::check_status;

/// Executes a single HTTP round-trip.
///
/// Implementations return `Ok` for any response the server produced,
/// including error statuses, and `Network`/`Timeout` when there was none.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &HttpRequest, timeout: Duration) -> ApiResult<HttpResponse>;
}

/// `Transport` over `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    with_session: reqwest::Client,
    anonymous: reqwest::Client,
}

impl ReqwestTransport {
    /// A transport with no session. Requests are sent without cookies even
    /// when they ask for credentials.
    pub fn new() -> ApiResult<Self> {
        let anonymous = build_client(None)?;
        Ok(Self {
            with_session: anonymous.clone(),
            anonymous,
        })
    }

    /// A transport that attaches cookies from `session` to requests that ask
    /// for credentials. The jar is read, never written, by this crate.
    pub fn with_session(session: Arc<Jar>) -> ApiResult<Self> {
        Ok(Self {
            with_session: build_client(Some(session))?,
            anonymous: build_client(None)?,
        })
    }
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

fn build_client(session: Option<Arc<Jar>>) -> ApiResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(jar) = session {
        builder = builder.cookie_provider(jar);
    }
    builder
        .build()
        .map_err(|e| ApiError::Config(format!("cannot build HTTP client: {e}")))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest, timeout: Duration) -> ApiResult<HttpResponse> {
        let client = if request.send_credentials {
            &self.with_session
        } else {
            &self.anonymous
        };
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                ApiError::Timeout { timeout }
            } else {
                ApiError::Network(e.to_string())
            }
        };

        let mut builder = client.post(&request.url).timeout(timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.text().await.map_err(classify)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Lifecycle of a single request.
///
/// `Pending -> Encoding -> InFlight -> {Succeeded | Retrying -> InFlight | Failed}`.
/// `Retrying` is reachable only for read-class requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Encoding,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

impl RequestState {
    pub fn can_transition(self, to: RequestState, class: RequestClass) -> bool {
        use RequestState::*;
        match (self, to) {
            (Pending, Encoding) | (Encoding, InFlight) | (Encoding, Failed) => true,
            (InFlight, Succeeded) | (InFlight, Failed) => true,
            (InFlight, Retrying) => class == RequestClass::Read,
            (Retrying, InFlight) => true,
            _ => false,
        }
    }

    fn advance(self, to: RequestState, class: RequestClass) -> RequestState {
        debug_assert!(
            self.can_transition(to, class),
            "illegal request transition {self:?} -> {to:?} for {class:?}"
        );
        trace!(from = ?self, to = ?to, "request state");
        to
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Succeeded | RequestState::Failed)
    }
}

/// Sends requests with timeout, status classification and retry.
#[derive(Clone)]
pub struct TransportClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TransportClient {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            transport,
            retry,
            timeout,
        }
    }

    /// Send `request` and return a 2xx response.
    ///
    /// Non-2xx statuses come back as `Auth` (401/403) or `Http`.
    pub async fn send(&self, request: &HttpRequest) -> ApiResult<HttpResponse> {
        let span = debug_span!(
            "rpc",
            kind = request.kind,
            request_id = %Uuid::new_v4(),
            url = %request.url,
        );
        self.send_with_retry(request).instrument(span).await
    }

    async fn send_with_retry(&self, request: &HttpRequest) -> ApiResult<HttpResponse> {
        let class = request.class;
        let max_attempts = match class {
            RequestClass::Read => self.retry.max_attempts.max(1),
            RequestClass::Write => 1,
        };
        let mut state = RequestState::Pending
            .advance(RequestState::Encoding, class)
            .advance(RequestState::InFlight, class);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(attempt, "sending request");
            let outcome = match tokio::time::timeout(
                self.timeout,
                self.transport.execute(request, self.timeout),
            )
            .await
            {
                Ok(result) => result.and_then(|resp| check_status(&resp).map(|()| resp)),
                Err(_) => Err(ApiError::Timeout {
                    timeout: self.timeout,
                }),
            };

            match outcome {
                Ok(response) => {
                    state.advance(RequestState::Succeeded, class);
                    debug!(attempt, status = response.status, "request succeeded");
                    return Ok(response);
                }
                Err(err)
                    if class == RequestClass::Read
                        && attempt < max_attempts
                        && err.is_retryable() =>
                {
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying request");
                    state = state
                        .advance(RequestState::Retrying, class)
                        .advance(RequestState::InFlight, class);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    state.advance(RequestState::Failed, class);
                    debug!(attempt, error = %err, "request failed");
                    return Err(err);
                }
            }
        }
    }
}
