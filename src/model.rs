// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Request and response bodies of the HTTP surface that are not plain
//! pass-through JSON.

use serde::{Deserialize, Serialize};

/// Body of `POST /gateway/post`; the caller carries the CSRF session itself.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPostRequest {
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
    #[serde(default)]
    pub transfer_data: Option<serde_json::Value>,
    #[serde(default)]
    pub is_test_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCsrfResponse {
    pub success: bool,
    pub csrf_token: String,
    pub cookies: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn gateway_post_request_reads_camel_case() {
        let request: GatewayPostRequest = serde_json::from_value(json!({
            "csrfToken": "tok",
            "cookies": "SAP_SESSIONID=1",
            "transferData": { "TransferItemSet": [] },
            "isTestRun": true
        }))
        .unwrap();

        assert_eq!(request.csrf_token.as_deref(), Some("tok"));
        assert_eq!(request.cookies.as_deref(), Some("SAP_SESSIONID=1"));
        assert!(request.transfer_data.is_some());
        assert!(request.is_test_run);
    }

    #[test]
    fn gateway_post_request_fields_are_optional() {
        let request: GatewayPostRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.csrf_token.is_none());
        assert!(!request.is_test_run);
    }

    #[test]
    fn csrf_response_serializes_camel_case() {
        let body = serde_json::to_value(GatewayCsrfResponse {
            success: true,
            csrf_token: "tok".into(),
            cookies: "a=b".into(),
        })
        .unwrap();

        assert_eq!(body, json!({ "success": true, "csrfToken": "tok", "cookies": "a=b" }));
    }
}
