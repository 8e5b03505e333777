// Copyright 2025 Memophor Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP API handlers for the BSP proxy.
//!
//! - `GET /healthz` - Service health check
//! - `GET /metrics` - Prometheus metrics export
//! - `GET /api/migo/metadata` - MIGO service `$metadata`
//! - `POST /api/migo/check` - Validate a transfer as a test run
//! - `POST /api/migo/post` - Execute a transfer
//! - `GET /api/migo/gateway/csrf` - Raw CSRF session from the gateway
//! - `POST /api/migo/gateway/post` - Post with a caller-held CSRF session
//! - `GET /api/BatchInfo/:batch` - Batch lookup on the direct backend
//! - `GET /api/BatchInfoGateway/:batch` - Batch lookup through the gateway
//! - `GET /api/batch/300/:batch` - Production batch read, passed through
//!
//! Credentials and transfer bodies are checked before any SAP call.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::credentials::{environment_tag, CallerIdentity, USER_AUTH_HEADER, USER_ENVIRONMENT_HEADER};
use crate::csrf::CSRF_HEADER;
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::model::{GatewayCsrfResponse, GatewayPostRequest, HealthResponse};
use crate::normalize::NormalizedResponse;
use crate::upstream::SapClient;
use crate::validation::validate_transfer;

#[derive(Clone)]
pub struct AppState {
    pub sap: SapClient,
    pub metrics: Metrics,
    /// Attach internal error chains to responses.
    pub diagnostics: bool,
}

impl AppState {
    fn respond<T: IntoResponse>(&self, result: Result<T, AppError>) -> Response {
        match result {
            Ok(body) => body.into_response(),
            Err(err) => {
                if err.status().is_server_error() {
                    tracing::error!(error = %err, "request failed");
                } else {
                    tracing::debug!(error = %err, "request rejected");
                }
                err.into_response_with(self.diagnostics)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Check,
    Post,
}

impl TransferMode {
    fn completed(self) -> &'static str {
        match self {
            TransferMode::Check => "Check completed",
            TransferMode::Post => "Post completed",
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(USER_AUTH_HEADER),
            HeaderName::from_static(USER_ENVIRONMENT_HEADER),
        ]);

    let migo = Router::new()
        .route("/metadata", get(handle_metadata))
        .route("/check", post(handle_check))
        .route("/post", post(handle_post))
        .route("/gateway/csrf", get(handle_gateway_csrf))
        .route("/gateway/post", post(handle_gateway_post));

    let batch = Router::new()
        .route("/BatchInfo/:batch", get(handle_batch_info))
        .route("/BatchInfoGateway/:batch", get(handle_batch_info_gateway))
        .route("/batch/300/:batch", get(handle_batch_300));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .nest("/api/migo", migo)
        .nest("/api", batch)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "bsp-proxy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state.metrics.export()
}

pub async fn handle_metadata(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let result = async {
        let caller = CallerIdentity::from_headers(&headers)?;
        let xml = state.sap.metadata(&caller).await?;
        Ok::<_, AppError>(([(CONTENT_TYPE, "application/xml")], xml))
    }
    .await;

    state.respond(result)
}

pub async fn handle_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = transfer(&state, &headers, &body, TransferMode::Check).await;
    state.respond(result)
}

pub async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = transfer(&state, &headers, &body, TransferMode::Post).await;
    state.respond(result)
}

async fn transfer(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    mode: TransferMode,
) -> Result<Json<NormalizedResponse>, AppError> {
    let caller = CallerIdentity::from_headers(headers)?;
    let body: Value = parse_body(body)?;

    let shape = validate_transfer(&body).inspect_err(|_| state.metrics.record_transfer_rejected())?;
    tracing::debug!(?shape, ?mode, environment = %caller.environment, "transfer request accepted");

    let reply = state.sap.submit_transfer(&caller, &body).await?;
    let normalized = reply.into_normalized(mode.completed())?;

    tracing::info!(
        success = normalized.success,
        material_document = normalized.data.material_document.as_deref().unwrap_or(""),
        "transfer finished"
    );

    Ok(Json(normalized))
}

pub async fn handle_gateway_csrf(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let result = async {
        state.sap.gateway()?;
        let caller = CallerIdentity::from_headers(&headers)?;
        let session = state.sap.gateway_csrf(&caller).await?;

        Ok::<_, AppError>(Json(GatewayCsrfResponse {
            success: true,
            csrf_token: session.token,
            cookies: session.cookies,
        }))
    }
    .await;

    state.respond(result)
}

pub async fn handle_gateway_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        state.sap.gateway()?;
        let caller = CallerIdentity::from_headers(&headers)?;
        let request: GatewayPostRequest = parse_body(&body)?;
        if let Some(transfer) = request.transfer_data.as_ref().filter(|data| !data.is_null()) {
            validate_transfer(transfer)
                .inspect_err(|_| state.metrics.record_transfer_rejected())?;
        }

        let normalized = state.sap.gateway_post(&caller, &request).await?;
        Ok::<_, AppError>(Json(normalized))
    }
    .await;

    state.respond(result)
}

/// Bodies are decoded by hand so that credentials are checked first and
/// decode failures still answer with the JSON error envelope.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::bad_request("Request body is required"));
    }

    serde_json::from_slice(body)
        .map_err(|err| AppError::bad_request(format!("Invalid JSON body: {err}")))
}

pub async fn handle_batch_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch): Path<String>,
) -> Response {
    let result = async {
        let caller = CallerIdentity::from_headers(&headers)?;
        let row = state.sap.batch_info(&caller, &batch).await?;
        Ok::<_, AppError>(Json(row))
    }
    .await;

    state.respond(result)
}

pub async fn handle_batch_info_gateway(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch): Path<String>,
) -> Response {
    let result = async {
        // Development reads may run under the service account, so a missing
        // header is only fatal once the environment asks for it.
        let caller = match CallerIdentity::from_headers(&headers) {
            Ok(caller) => Some(caller),
            Err(AppError::CredentialsRequired) => None,
            Err(err) => return Err(err),
        };

        let row = state
            .sap
            .batch_info_gateway(&environment_tag(&headers), caller.as_ref(), &batch)
            .await?;
        Ok::<_, AppError>(Json(row))
    }
    .await;

    state.respond(result)
}

pub async fn handle_batch_300(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(batch): Path<String>,
) -> Response {
    let result = async {
        let caller = CallerIdentity::from_headers(&headers)?;
        let (status, body) = state.sap.batch_300(&caller, &batch).await?;
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        Ok::<_, AppError>((status, Json(body)))
    }
    .await;

    state.respond(result)
}
