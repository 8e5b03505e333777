// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! CSRF token handshake for SAP's stateful OData write endpoints.
//!
//! A fetch walks an ordered list of [`FetchStep`]s. A step that fails at the
//! transport level hands over to the next one; the first step that gets any
//! HTTP answer decides the outcome. A missing `x-csrf-token` header is a
//! failure whatever the status code.

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, SET_COOKIE};
use reqwest::{Client, Method};
use tokio::time::Instant;

use crate::credentials::Credentials;
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::upstream::transport_error;

pub const CSRF_HEADER: &str = "x-csrf-token";
const FETCH_SENTINEL: &str = "Fetch";

/// Token plus the session cookies it is bound to. Never outlives a request.
#[derive(Clone, PartialEq, Eq)]
pub struct CsrfSession {
    pub token: String,
    pub cookies: String,
    /// Status of the response that carried the token.
    pub status: u16,
}

impl std::fmt::Debug for CsrfSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfSession")
            .field("token_len", &self.token.len())
            .field("cookies_len", &self.cookies.len())
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Head,
    Get,
}

impl FetchStrategy {
    fn method(self) -> Method {
        match self {
            FetchStrategy::Head => Method::HEAD,
            FetchStrategy::Get => Method::GET,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FetchStrategy::Head => "head",
            FetchStrategy::Get => "get",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchStep {
    pub strategy: FetchStrategy,
    pub url: String,
}

impl FetchStep {
    pub fn new(strategy: FetchStrategy, url: impl Into<String>) -> Self {
        Self {
            strategy,
            url: url.into(),
        }
    }

    /// Metadata-only probe first, full GET of the same URL if the HEAD never gets an answer.
    pub fn head_then_get(url: &str) -> Vec<FetchStep> {
        vec![
            FetchStep::new(FetchStrategy::Head, url),
            FetchStep::new(FetchStrategy::Get, url),
        ]
    }

    pub fn get_only(url: &str) -> Vec<FetchStep> {
        vec![FetchStep::new(FetchStrategy::Get, url)]
    }
}

/// Everything one handshake needs.
#[derive(Debug, Clone)]
pub struct CsrfRequest<'a> {
    pub steps: Vec<FetchStep>,
    pub credentials: &'a Credentials,
    pub timeout: Duration,
    pub sap_client: Option<&'a str>,
    /// Error text used when the upstream omits the token.
    pub missing_message: &'a str,
}

#[derive(Clone)]
pub struct CsrfAcquirer {
    client: Client,
    metrics: Metrics,
}

impl CsrfAcquirer {
    pub fn new(client: Client, metrics: Metrics) -> Self {
        Self { client, metrics }
    }

    pub async fn acquire(&self, request: CsrfRequest<'_>) -> Result<CsrfSession, AppError> {
        self.metrics.record_csrf_fetch();

        let mut last_error = None;
        for step in &request.steps {
            match self.probe(step, &request).await {
                Ok((status, headers)) => {
                    return self.session_from(status, &headers, request.missing_message);
                }
                Err(err) => {
                    tracing::debug!(
                        strategy = step.strategy.as_str(),
                        url = %step.url,
                        error = %err,
                        "CSRF fetch step failed at transport level"
                    );
                    last_error = Some(err);
                }
            }
        }

        self.metrics.record_csrf_failure();
        Err(match last_error {
            Some(err) => transport_error(err, "CSRF token fetch"),
            None => AppError::CsrfUnavailable {
                message: request.missing_message.to_string(),
                status: None,
            },
        })
    }

    async fn probe(
        &self,
        step: &FetchStep,
        request: &CsrfRequest<'_>,
    ) -> Result<(u16, HeaderMap), reqwest::Error> {
        let mut builder = self
            .client
            .request(step.strategy.method(), &step.url)
            .basic_auth(
                &request.credentials.username,
                Some(&request.credentials.password),
            )
            .header(CSRF_HEADER, FETCH_SENTINEL)
            .header(ACCEPT, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .timeout(request.timeout);

        if let Some(client) = request.sap_client {
            builder = builder.query(&[("sap-client", client)]);
        }

        self.metrics.record_upstream_request();
        let start = Instant::now();
        let result = builder.send().await;
        self.metrics
            .record_upstream_latency(start.elapsed().as_secs_f64());

        let response = result.inspect_err(|_| self.metrics.record_upstream_failure())?;
        let status = response.status().as_u16();
        tracing::debug!(
            strategy = step.strategy.as_str(),
            status,
            "CSRF fetch step answered"
        );
        Ok((status, response.headers().clone()))
    }

    fn session_from(
        &self,
        status: u16,
        headers: &HeaderMap,
        missing_message: &str,
    ) -> Result<CsrfSession, AppError> {
        let token = headers
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            self.metrics.record_csrf_failure();
            tracing::warn!(status, "SAP answered the CSRF fetch without a token");
            return Err(AppError::CsrfUnavailable {
                message: missing_message.to_string(),
                status: Some(status),
            });
        };

        tracing::debug!(status, token_len = token.len(), "CSRF token acquired");
        Ok(CsrfSession {
            token: token.to_string(),
            cookies: session_cookies(headers),
            status,
        })
    }
}

/// Reduce every `Set-Cookie` to its `name=value` pair, joined for a `Cookie` header.
pub fn session_cookies(headers: &HeaderMap) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}
