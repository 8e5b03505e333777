// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Upstream dispatcher for the SAP OData services.
//!
//! Writes go through the CSRF handshake and then either the API-management
//! gateway or the direct backend, depending on the caller's environment.
//! Reads of `BatchInfoSet` use plain authenticated GETs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::{EndpointPair, GatewayConfig, SapConfig};
use crate::credentials::{CallerIdentity, Credentials};
use crate::csrf::{CsrfAcquirer, CsrfRequest, CsrfSession, FetchStep, FetchStrategy, CSRF_HEADER};
use crate::environment::{join_url, DispatchPlan, Environment, EnvironmentResolver};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::model::GatewayPostRequest;
use crate::normalize::{normalize, NormalizedResponse, UpstreamPayload};

const GATEWAY_NO_TOKEN: &str = "No CSRF token returned by SAP API Management";
const DIRECT_NO_TOKEN: &str = "No CSRF token returned by SAP";
const GATEWAY_CSRF_NO_TOKEN: &str = "No X-CSRF-Token returned by SAP API Management";
const GATEWAY_NOT_CONFIGURED: &str = "SAP API Management URL not configured";
const BATCH_NOT_FOUND: &str = "Batch not found";
const BATCH_INFO_SET: &str = "BatchInfoSet";

/// Map a reqwest failure onto the timeout/unreachable split.
pub fn transport_error(err: reqwest::Error, what: &str) -> AppError {
    if err.is_timeout() {
        AppError::UpstreamTimeout(format!(
            "{what} timed out - SAP server is not responding"
        ))
    } else {
        AppError::UpstreamUnreachable(format!("{what} failed: {err}"))
    }
}

/// Escape a value for use inside an OData string literal.
pub fn odata_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Gateway,
    Direct,
}

impl Route {
    fn as_str(self) -> &'static str {
        match self {
            Route::Gateway => "gateway",
            Route::Direct => "direct",
        }
    }
}

/// What SAP answered to a transfer write.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub payload: UpstreamPayload,
    pub route: Route,
}

impl UpstreamReply {
    /// Status >= 400 is a business failure carrying SAP's own message.
    pub fn into_normalized(self, completed: &str) -> Result<NormalizedResponse, AppError> {
        if self.status >= 400 {
            return Err(AppError::UpstreamBusiness {
                status: self.status,
                message: self.payload.error_message(self.status),
                raw: self.payload.raw(),
            });
        }

        Ok(normalize(&self.payload, self.status, completed))
    }
}

/// HTTP client wrapper for the SAP services.
#[derive(Clone)]
pub struct SapClient {
    client: Client,
    csrf: CsrfAcquirer,
    resolver: EnvironmentResolver,
    metrics: Metrics,
}

impl SapClient {
    /// Construct a new SAP client using the provided configuration.
    pub fn try_new(config: Arc<SapConfig>, metrics: Metrics) -> Result<Self, AppError> {
        // No cookie store: session cookies are forwarded explicitly per request.
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| AppError::Internal(anyhow!("Failed to build SAP client: {}", e)))?;

        if config.accept_invalid_certs {
            tracing::warn!("TLS certificate validation towards SAP is disabled");
        }

        Ok(Self {
            csrf: CsrfAcquirer::new(client.clone(), metrics.clone()),
            client,
            resolver: EnvironmentResolver::new(config),
            metrics,
        })
    }

    pub fn resolver(&self) -> &EnvironmentResolver {
        &self.resolver
    }

    fn config(&self) -> &SapConfig {
        self.resolver.config()
    }

    /// Acquire a fresh CSRF session and post `body` to `TransferHeaderSet`.
    /// The caller must have validated `body` already.
    pub async fn submit_transfer(
        &self,
        caller: &CallerIdentity,
        body: &Value,
    ) -> Result<UpstreamReply, AppError> {
        let resolution = self.resolver.resolve(&caller.environment);
        tracing::info!(
            environment = %resolution.environment,
            sap_client = %resolution.sap_client,
            production = resolution.is_production,
            base_url = %resolution.base_url,
            csrf_url = resolution.csrf_url(),
            post_url = resolution.post_url(),
            "dispatching MIGO transfer"
        );

        match &resolution.plan {
            DispatchPlan::GatewayOnly(gateway) => {
                self.gateway_attempt(gateway, caller, body, self.config().timeout, false)
                    .await
            }
            DispatchPlan::GatewayThenDirect { gateway, direct } => {
                let probe_timeout = self.config().probe_timeout;
                match self
                    .gateway_attempt(gateway, caller, body, probe_timeout, true)
                    .await
                {
                    Err(err) if err.allows_fallback() => {
                        tracing::warn!(
                            error = %err,
                            "API Management attempt failed, falling back to direct SAP connection"
                        );
                        self.metrics.record_gateway_fallback();
                        self.direct_attempt(direct, caller, body, &resolution.sap_client)
                            .await
                    }
                    other => other,
                }
            }
        }
    }

    async fn gateway_attempt(
        &self,
        gateway: &EndpointPair,
        caller: &CallerIdentity,
        body: &Value,
        csrf_timeout: Duration,
        require_ok_status: bool,
    ) -> Result<UpstreamReply, AppError> {
        let session = self
            .csrf
            .acquire(CsrfRequest {
                steps: FetchStep::head_then_get(&gateway.csrf_url),
                credentials: &caller.credentials,
                timeout: csrf_timeout,
                sap_client: None,
                missing_message: GATEWAY_NO_TOKEN,
            })
            .await?;

        if require_ok_status && session.status >= 400 {
            return Err(AppError::CsrfUnavailable {
                message: GATEWAY_NO_TOKEN.to_string(),
                status: Some(session.status),
            });
        }

        self.post_transfer(
            &gateway.post_url,
            &caller.credentials,
            &session,
            body,
            None,
            Route::Gateway,
        )
        .await
    }

    async fn direct_attempt(
        &self,
        direct: &EndpointPair,
        caller: &CallerIdentity,
        body: &Value,
        sap_client: &str,
    ) -> Result<UpstreamReply, AppError> {
        let session = self
            .csrf
            .acquire(CsrfRequest {
                steps: FetchStep::get_only(&direct.csrf_url),
                credentials: &caller.credentials,
                timeout: self.config().timeout,
                sap_client: Some(sap_client),
                missing_message: DIRECT_NO_TOKEN,
            })
            .await?;

        self.post_transfer(
            &direct.post_url,
            &caller.credentials,
            &session,
            body,
            Some(sap_client),
            Route::Direct,
        )
        .await
    }

    async fn post_transfer(
        &self,
        url: &str,
        credentials: &Credentials,
        session: &CsrfSession,
        body: &Value,
        sap_client: Option<&str>,
        route: Route,
    ) -> Result<UpstreamReply, AppError> {
        let mut builder = self
            .with_session(self.client.post(url), credentials, Some(session))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .timeout(self.config().timeout)
            .json(body);

        if let Some(client) = sap_client {
            builder = builder.query(&[("sap-client", client)]);
        }

        let (status, text) = self.send(builder, "MIGO post").await?;
        tracing::info!(route = route.as_str(), status, "SAP answered MIGO post");

        Ok(UpstreamReply {
            status,
            payload: UpstreamPayload::detect(&text),
            route,
        })
    }

    /// `$metadata` of the direct MIGO service, as XML text.
    pub async fn metadata(&self, caller: &CallerIdentity) -> Result<String, AppError> {
        let environment = Environment::normalize(&caller.environment);
        let url = join_url(&self.resolver.migo_service_root(&environment), "$metadata");

        let builder = self
            .with_session(self.client.get(url), &caller.credentials, None)
            .header(ACCEPT, "application/xml")
            .query(&[("sap-client", environment.sap_client())]);

        let (status, text) = self.send(builder, "Metadata request").await?;
        if status >= 400 {
            let payload = UpstreamPayload::detect(&text);
            return Err(AppError::UpstreamBusiness {
                status,
                message: payload.error_message(status),
                raw: payload.raw(),
            });
        }

        Ok(text)
    }

    /// First `BatchInfoSet` row for `batch`, read straight from the backend.
    pub async fn batch_info(
        &self,
        caller: &CallerIdentity,
        batch: &str,
    ) -> Result<Value, AppError> {
        let environment = Environment::normalize(&caller.environment);
        let url = join_url(
            &self.resolver.batch_service_root(&environment),
            BATCH_INFO_SET,
        );
        tracing::info!(environment = %environment, batch, "fetching batch info");

        let builder = self
            .with_session(self.client.get(url), &caller.credentials, None)
            .header(ACCEPT, "application/json")
            .query(&[
                ("$filter", format!("Charg eq '{}'", odata_literal(batch))),
                ("$format", "json".to_string()),
                ("sap-client", environment.sap_client().to_string()),
            ]);

        let (status, text) = self.send(builder, "Batch request").await?;
        let payload = UpstreamPayload::detect(&text);

        if status == StatusCode::UNAUTHORIZED.as_u16() {
            return Err(AppError::UpstreamBusiness {
                status,
                message: "Unauthorized. Check SAP credentials.".to_string(),
                raw: payload.raw(),
            });
        }

        if status != StatusCode::OK.as_u16() {
            return Err(AppError::UpstreamBusiness {
                status,
                message: "Error fetching batch info from SAP".to_string(),
                raw: payload.raw(),
            });
        }

        odata_results(&payload.raw())
            .and_then(|rows| rows.first().cloned())
            .ok_or_else(|| AppError::not_found(BATCH_NOT_FOUND))
    }

    /// Batch lookup through the API-management gateway.
    pub async fn batch_info_gateway(
        &self,
        environment_tag: &str,
        caller: Option<&CallerIdentity>,
        batch: &str,
    ) -> Result<Value, AppError> {
        let environment = Environment::normalize(environment_tag);
        if environment.is_production() {
            let caller = caller.ok_or(AppError::CredentialsRequired)?;
            return self.prd_batch_via_gateway(&caller.credentials, batch).await;
        }

        let credentials = self
            .config()
            .service_account
            .as_ref()
            .or(caller.map(|caller| &caller.credentials))
            .ok_or(AppError::CredentialsRequired)?;

        let url = join_url(&self.config().dev_batch_url, BATCH_INFO_SET);
        tracing::info!(batch, %url, "fetching batch info from development gateway");

        let builder = self
            .with_session(self.client.get(url), credentials, None)
            .header(ACCEPT, "application/json")
            .query(&[
                ("$filter", format!("Charg eq '{}'", odata_literal(batch))),
                ("$format", "json".to_string()),
            ]);

        let (status, text) = self.send(builder, "Gateway batch request").await?;
        let payload = UpstreamPayload::detect(&text);

        if status != StatusCode::OK.as_u16() {
            return Err(AppError::UpstreamBusiness {
                status,
                message: "Error from SAP API Management".to_string(),
                raw: payload.raw(),
            });
        }

        odata_results(&payload.raw())
            .and_then(|rows| rows.first().cloned())
            .ok_or_else(|| AppError::not_found(BATCH_NOT_FOUND))
    }

    async fn prd_batch_via_gateway(
        &self,
        credentials: &Credentials,
        batch: &str,
    ) -> Result<Value, AppError> {
        let entity_set = self.config().prd_batch_url.split('?').next().unwrap_or_default();
        let service_root = entity_set
            .strip_suffix(&format!("/{BATCH_INFO_SET}"))
            .unwrap_or(entity_set);

        // Reads work without a token; the handshake only supplies the session.
        let session = match self
            .csrf
            .acquire(CsrfRequest {
                steps: vec![
                    FetchStep::new(FetchStrategy::Head, service_root),
                    FetchStep::new(FetchStrategy::Get, entity_set),
                ],
                credentials,
                timeout: self.config().timeout,
                sap_client: None,
                missing_message: GATEWAY_NO_TOKEN,
            })
            .await
        {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::warn!(error = %err, "continuing batch read without CSRF session");
                None
            }
        };

        let mut first_failure = None;
        for field in ["BatchNumber", "Charg"] {
            let builder = self
                .with_session(self.client.get(entity_set), credentials, session.as_ref())
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .query(&[("$filter", format!("{field} eq '{}'", odata_literal(batch)))]);

            let (status, text) = self.send(builder, "Production batch request").await?;
            let payload = UpstreamPayload::detect(&text);
            tracing::info!(field, status, "production gateway answered batch read");

            if status == StatusCode::OK.as_u16() {
                let raw = payload.raw();
                let rows = odata_results(&raw).unwrap_or_else(|| vec![raw]);
                return rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::not_found(BATCH_NOT_FOUND));
            }

            if first_failure.is_none() {
                first_failure = Some((status, payload));
            }

            // Some services name the batch field `Charg`; only a 400 warrants the second probe.
            if status != StatusCode::BAD_REQUEST.as_u16() {
                break;
            }
        }

        let (status, payload) = first_failure
            .ok_or_else(|| AppError::Internal(anyhow!("batch probe loop produced no response")))?;
        let message = match &payload {
            UpstreamPayload::ODataJson(_) | UpstreamPayload::PlainJson(_) => {
                payload.error_message(status)
            }
            _ => "Error from SAP API".to_string(),
        };

        Err(AppError::UpstreamBusiness {
            status,
            message,
            raw: payload.raw(),
        })
    }

    /// Production `BatchInfoSet` read with SAP's status and body passed through.
    pub async fn batch_300(
        &self,
        caller: &CallerIdentity,
        batch: &str,
    ) -> Result<(u16, Value), AppError> {
        let url = self.config().prd_batch_url.clone();
        let builder = self
            .with_session(self.client.get(url), &caller.credentials, None)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .query(&[(
                "$filter",
                format!("BatchNumber eq '{}'", odata_literal(batch)),
            )]);

        let (status, text) = self.send(builder, "300 level batch request").await?;
        Ok((status, UpstreamPayload::detect(&text).raw()))
    }

    /// Settings of the raw `/gateway/*` routes, if API management is configured.
    pub fn gateway(&self) -> Result<&GatewayConfig, AppError> {
        self.config()
            .gateway
            .as_ref()
            .ok_or_else(|| AppError::NotConfigured(GATEWAY_NOT_CONFIGURED.to_string()))
    }

    /// Raw token fetch against the configured gateway MIGO root.
    pub async fn gateway_csrf(&self, caller: &CallerIdentity) -> Result<CsrfSession, AppError> {
        let gateway = self.gateway()?;

        let url = format!("{}/", gateway.migo_url.trim_end_matches('/'));
        self.csrf
            .acquire(CsrfRequest {
                steps: FetchStep::get_only(&url),
                credentials: &caller.credentials,
                timeout: self.config().timeout,
                sap_client: None,
                missing_message: GATEWAY_CSRF_NO_TOKEN,
            })
            .await
    }

    /// Post with a caller-supplied CSRF session; the XML answer is normalized.
    pub async fn gateway_post(
        &self,
        caller: &CallerIdentity,
        request: &GatewayPostRequest,
    ) -> Result<NormalizedResponse, AppError> {
        let gateway = self.gateway()?;

        let token = request
            .csrf_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AppError::bad_request("CSRF token is required"))?;
        let transfer = request
            .transfer_data
            .as_ref()
            .filter(|data| !data.is_null())
            .ok_or_else(|| AppError::bad_request("Transfer data is required"))?;

        let session = CsrfSession {
            token: token.to_string(),
            cookies: request.cookies.clone().unwrap_or_default(),
            status: StatusCode::OK.as_u16(),
        };

        tracing::info!(test_run = request.is_test_run, "posting to SAP API Management gateway");
        let builder = self
            .with_session(
                self.client.post(&gateway.migo_post_url),
                &caller.credentials,
                Some(&session),
            )
            .header(ACCEPT, "application/xml")
            .header(CONTENT_TYPE, "application/json")
            .json(transfer);

        let (status, text) = self.send(builder, "Gateway post").await?;
        Ok(normalize(
            &UpstreamPayload::detect(&text),
            status,
            "Operation completed successfully",
        ))
    }

    fn with_session(
        &self,
        builder: RequestBuilder,
        credentials: &Credentials,
        session: Option<&CsrfSession>,
    ) -> RequestBuilder {
        let mut builder = builder
            .basic_auth(&credentials.username, Some(&credentials.password))
            .header("X-Requested-With", "XMLHttpRequest");

        if let Some(session) = session {
            builder = builder.header(CSRF_HEADER, &session.token);
            if !session.cookies.is_empty() {
                builder = builder.header(COOKIE, &session.cookies);
            }
        }

        builder
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<(u16, String), AppError> {
        self.metrics.record_upstream_request();
        let start = Instant::now();

        let result = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        }
        .await;

        self.metrics
            .record_upstream_latency(start.elapsed().as_secs_f64());

        result.map_err(|err| {
            self.metrics.record_upstream_failure();
            tracing::error!(error = %err, "{what} failed");
            transport_error(err, what)
        })
    }
}

/// Rows of an OData `d.results` collection.
fn odata_results(value: &Value) -> Option<Vec<Value>> {
    value
        .pointer("/d/results")
        .and_then(Value::as_array)
        .cloned()
}
