// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Response normalization for SAP MIGO calls.
//!
//! SAP answers the same write with OData-wrapped JSON, bare JSON, Atom XML,
//! or (from the gateway) an HTML error page. Each shape gets its own decoder;
//! [`normalize`] dispatches on the detected shape and always yields the same
//! envelope. Parsing problems never escape as errors.

use serde::Serialize;
use serde_json::Value;

use crate::xml;

const GENERIC_SUCCESS: &str = "Operation completed successfully";
const GENERIC_FAILURE: &str = "Operation failed";
const HTML_ERROR: &str = "SAP API Management returned HTML error page";
const UNPARSEABLE: &str = "Unable to parse SAP response";

/// Locations of the `properties` node in the Atom shapes SAP produces.
const PROPERTY_PATHS: [&[&str]; 3] = [
    &["entry", "content", "properties"],
    &["content", "properties"],
    &["properties"],
];

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPayload {
    /// JSON wrapped in the OData `d` envelope.
    ODataJson(Value),
    /// JSON without an envelope.
    PlainJson(Value),
    /// XML decoded into a tree by [`xml::parse`].
    ODataXml(Value),
    /// An HTML page, typically a gateway error screen.
    HtmlError(String),
    /// Non-empty text that is neither JSON nor XML.
    Text(String),
    /// XML that failed to parse.
    Malformed { body: String, reason: String },
    Empty,
}

impl UpstreamPayload {
    pub fn detect(body: &str) -> Self {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return UpstreamPayload::Empty;
        }

        if is_html(trimmed) {
            return UpstreamPayload::HtmlError(trimmed.to_string());
        }

        if trimmed.starts_with('<') {
            return match xml::parse(trimmed) {
                Ok(tree) => UpstreamPayload::ODataXml(tree),
                Err(err) => UpstreamPayload::Malformed {
                    body: trimmed.to_string(),
                    reason: err.to_string(),
                },
            };
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.get("d").is_some() => UpstreamPayload::ODataJson(value),
            Ok(value) => UpstreamPayload::PlainJson(value),
            Err(_) => UpstreamPayload::Text(trimmed.to_string()),
        }
    }

    /// The payload as JSON for echoing back to the caller.
    pub fn raw(&self) -> Value {
        match self {
            UpstreamPayload::ODataJson(value)
            | UpstreamPayload::PlainJson(value)
            | UpstreamPayload::ODataXml(value) => value.clone(),
            UpstreamPayload::HtmlError(text) | UpstreamPayload::Text(text) => {
                Value::String(text.clone())
            }
            UpstreamPayload::Malformed { body, .. } => Value::String(body.clone()),
            UpstreamPayload::Empty => Value::Null,
        }
    }

    /// Error text for an upstream status >= 400.
    pub fn error_message(&self, status: u16) -> String {
        let found = match self {
            UpstreamPayload::ODataJson(value) | UpstreamPayload::PlainJson(value) => {
                json_error_message(value)
            }
            UpstreamPayload::ODataXml(tree) => xml_error_message(tree),
            _ => None,
        };

        found.unwrap_or_else(|| format!("SAP API returned status {status}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedData {
    pub material_document: Option<String>,
    pub document_year: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub data: NormalizedData,
}

impl NormalizedResponse {
    fn new(
        success: bool,
        message: String,
        material_document: Option<String>,
        document_year: Option<String>,
        raw: Value,
    ) -> Self {
        let error = (!success).then(|| message.clone());
        Self {
            success,
            message,
            error,
            data: NormalizedData {
                material_document,
                document_year,
                raw,
            },
        }
    }

    fn failure(message: impl Into<String>, raw: Value) -> Self {
        Self::new(false, message.into(), None, None, raw)
    }
}

/// Normalize a non-error upstream reply. `completed` is the message used for
/// a success that carries no message of its own.
pub fn normalize(payload: &UpstreamPayload, status: u16, completed: &str) -> NormalizedResponse {
    match payload {
        UpstreamPayload::ODataJson(value) | UpstreamPayload::PlainJson(value) => {
            normalize_json(value, status, completed)
        }
        UpstreamPayload::ODataXml(tree) => normalize_xml(tree),
        UpstreamPayload::HtmlError(_) => NormalizedResponse::failure(HTML_ERROR, Value::Null),
        UpstreamPayload::Text(text) => {
            NormalizedResponse::failure(text.clone(), Value::String(text.clone()))
        }
        UpstreamPayload::Malformed { body, reason } => {
            tracing::warn!(%reason, "SAP returned unparseable XML");
            NormalizedResponse::failure(UNPARSEABLE, Value::String(body.clone()))
        }
        UpstreamPayload::Empty => {
            let success = status == 200;
            let message = if success { completed } else { GENERIC_FAILURE };
            NormalizedResponse::new(success, message.to_string(), None, None, Value::Null)
        }
    }
}

/// `field` from the `d` envelope, else from the top level.
fn json_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value
        .get("d")
        .and_then(|d| d.get(field))
        .filter(|v| !v.is_null())
        .or_else(|| value.get(field).filter(|v| !v.is_null()))
}

fn normalize_json(value: &Value, status: u16, completed: &str) -> NormalizedResponse {
    // 200 without an explicit flag counts as success.
    let success = match success_flag(value) {
        Some(flag) => flag,
        None => status == 200,
    };

    let message = json_field(value, "Message")
        .and_then(scalar_text)
        .unwrap_or_else(|| {
            if success {
                completed.to_string()
            } else {
                GENERIC_FAILURE.to_string()
            }
        });

    NormalizedResponse::new(
        success,
        message,
        json_field(value, "MatDoc").and_then(scalar_text),
        json_field(value, "MatDocYear").and_then(scalar_text),
        value.clone(),
    )
}

/// `Some(true)` if any `Success` flag is literally `true`, `Some(false)` if
/// a boolean flag is present but none is true.
fn success_flag(value: &Value) -> Option<bool> {
    let flags: Vec<bool> = [value.get("d").and_then(|d| d.get("Success")), value.get("Success")]
        .into_iter()
        .flatten()
        .filter_map(Value::as_bool)
        .collect();

    if flags.is_empty() {
        None
    } else {
        Some(flags.contains(&true))
    }
}

fn normalize_xml(tree: &Value) -> NormalizedResponse {
    if let Some(error) = xml::child(tree, "error") {
        let message = error_node_message(error).unwrap_or_else(|| "Unknown SAP error".to_string());
        return NormalizedResponse::failure(message, tree.clone());
    }

    let Some(properties) = PROPERTY_PATHS
        .iter()
        .find_map(|segments| xml::path(tree, segments))
    else {
        return NormalizedResponse::new(
            true,
            GENERIC_SUCCESS.to_string(),
            None,
            None,
            tree.clone(),
        );
    };

    let property = |name: &str| -> Option<String> {
        [name.to_string(), format!("Ev{name}")]
            .iter()
            .filter_map(|key| xml::child(properties, key))
            .filter_map(xml::text)
            .find(|text| !text.is_empty())
            .map(str::to_string)
    };

    let success = property("Success").is_some_and(|flag| flag == "true");
    let message = property("Message").unwrap_or_else(|| {
        if success {
            GENERIC_SUCCESS.to_string()
        } else {
            GENERIC_FAILURE.to_string()
        }
    });

    NormalizedResponse::new(
        success,
        message,
        property("MatDoc"),
        property("MatDocYear"),
        tree.clone(),
    )
}

fn error_node_message(error: &Value) -> Option<String> {
    let message = xml::child(error, "message")?;
    xml::text(message)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn json_error_message(value: &Value) -> Option<String> {
    let error_message = value.get("error").and_then(|e| e.get("message"));

    error_message
        .and_then(|m| m.get("value"))
        .and_then(scalar_text)
        .or_else(|| error_message.and_then(scalar_text))
        .or_else(|| value.get("message").and_then(scalar_text))
}

fn xml_error_message(tree: &Value) -> Option<String> {
    xml::child(tree, "error").and_then(error_node_message)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn is_html(body: &str) -> bool {
    let head: String = body.chars().take(16).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn detects_each_payload_shape() {
        assert!(matches!(
            UpstreamPayload::detect(r#"{"d":{"Success":true}}"#),
            UpstreamPayload::ODataJson(_)
        ));
        assert!(matches!(
            UpstreamPayload::detect(r#"{"Success":true}"#),
            UpstreamPayload::PlainJson(_)
        ));
        assert!(matches!(
            UpstreamPayload::detect("<properties><d:Success>true</d:Success></properties>"),
            UpstreamPayload::ODataXml(_)
        ));
        assert!(matches!(
            UpstreamPayload::detect("<!DOCTYPE html><html><body>502</body></html>"),
            UpstreamPayload::HtmlError(_)
        ));
        assert!(matches!(
            UpstreamPayload::detect("  <HTML><body>oops</body></HTML>"),
            UpstreamPayload::HtmlError(_)
        ));
        assert!(matches!(
            UpstreamPayload::detect("Policy violation"),
            UpstreamPayload::Text(_)
        ));
        assert!(matches!(
            UpstreamPayload::detect("<a><b></a>"),
            UpstreamPayload::Malformed { .. }
        ));
        assert_eq!(UpstreamPayload::detect("   "), UpstreamPayload::Empty);
    }

    #[test]
    fn odata_json_envelope_is_unwrapped() {
        let payload = UpstreamPayload::detect(
            r#"{"d":{"Success":true,"MatDoc":"123","MatDocYear":"2024"}}"#,
        );
        let normalized = normalize(&payload, 201, "Post completed");

        assert!(normalized.success);
        assert_eq!(normalized.message, "Post completed");
        assert_eq!(normalized.data.material_document.as_deref(), Some("123"));
        assert_eq!(normalized.data.document_year.as_deref(), Some("2024"));
        assert_eq!(normalized.error, None);
    }

    #[test]
    fn plain_json_fields_are_read_at_top_level() {
        let payload = UpstreamPayload::PlainJson(json!({
            "Success": true,
            "Message": "Document 4900000001 posted",
            "MatDoc": "4900000001",
            "MatDocYear": 2025
        }));
        let normalized = normalize(&payload, 201, "Post completed");

        assert!(normalized.success);
        assert_eq!(normalized.message, "Document 4900000001 posted");
        assert_eq!(normalized.data.document_year.as_deref(), Some("2025"));
    }

    #[test]
    fn status_200_without_flag_counts_as_success() {
        let payload = UpstreamPayload::PlainJson(json!({ "d": {} }));
        let normalized = normalize(&payload, 200, "Check completed");

        assert!(normalized.success);
        assert_eq!(normalized.message, "Check completed");
        assert_eq!(normalized.data.material_document, None);
    }

    #[test]
    fn explicit_false_flag_wins_over_status_200() {
        let payload = UpstreamPayload::detect(r#"{"d":{"Success":false,"Message":"Batch locked"}}"#);
        let normalized = normalize(&payload, 200, "Check completed");

        assert!(!normalized.success);
        assert_eq!(normalized.error.as_deref(), Some("Batch locked"));
    }

    #[test]
    fn non_200_without_flag_is_a_failure() {
        let payload = UpstreamPayload::PlainJson(json!({}));
        let normalized = normalize(&payload, 201, "Post completed");

        assert!(!normalized.success);
        assert_eq!(normalized.message, GENERIC_FAILURE);
    }

    #[test]
    fn bare_properties_xml_is_decoded() {
        let payload = UpstreamPayload::detect(
            "<properties><d:Success>true</d:Success><d:MatDoc>4900012345</d:MatDoc></properties>",
        );
        let normalized = normalize(&payload, 201, "Post completed");

        assert!(normalized.success);
        assert_eq!(normalized.message, GENERIC_SUCCESS);
        assert_eq!(
            normalized.data.material_document.as_deref(),
            Some("4900012345")
        );
        assert_eq!(normalized.data.document_year, None);
    }

    #[test]
    fn atom_entry_with_ev_prefixed_fields() {
        let payload = UpstreamPayload::detect(
            r#"<?xml version="1.0" encoding="utf-8"?>
            <entry xmlns="http://www.w3.org/2005/Atom"
                   xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata"
                   xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices">
              <content type="application/xml">
                <m:properties>
                  <d:EvSuccess>false</d:EvSuccess>
                  <d:EvMessage>Deficit of SL Unrestricted-use 5 KG</d:EvMessage>
                  <d:EvMatDoc/>
                  <d:EvMatDocYear>0000</d:EvMatDocYear>
                </m:properties>
              </content>
            </entry>"#,
        );
        let normalized = normalize(&payload, 201, "Post completed");

        assert!(!normalized.success);
        assert_eq!(normalized.message, "Deficit of SL Unrestricted-use 5 KG");
        assert_eq!(normalized.data.material_document, None);
        assert_eq!(normalized.data.document_year.as_deref(), Some("0000"));
    }

    #[test]
    fn xml_error_node_is_a_failure() {
        let payload = UpstreamPayload::detect(
            r#"<?xml version="1.0"?><error><code>SY/530</code><message xml:lang="en">Material is locked</message></error>"#,
        );
        let normalized = normalize(&payload, 200, "Post completed");

        assert!(!normalized.success);
        assert_eq!(normalized.error.as_deref(), Some("Material is locked"));
        assert_eq!(payload.error_message(400), "Material is locked");
    }

    #[test]
    fn xml_without_properties_degrades_to_generic_success() {
        let payload = UpstreamPayload::detect("<feed><title>TransferHeaderSet</title></feed>");
        let normalized = normalize(&payload, 201, "Post completed");

        assert!(normalized.success);
        assert_eq!(normalized.message, GENERIC_SUCCESS);
    }

    #[test]
    fn html_and_text_degrade_to_failures() {
        let html = normalize(
            &UpstreamPayload::detect("<!DOCTYPE html><html></html>"),
            200,
            "Post completed",
        );
        assert!(!html.success);
        assert_eq!(html.error.as_deref(), Some(HTML_ERROR));

        let text = normalize(&UpstreamPayload::detect("Quota exceeded"), 200, "Post completed");
        assert!(!text.success);
        assert_eq!(text.message, "Quota exceeded");

        let malformed = normalize(&UpstreamPayload::detect("<a><b></a>"), 200, "Post completed");
        assert!(!malformed.success);
        assert_eq!(malformed.message, UNPARSEABLE);
    }

    #[test]
    fn error_message_probes_several_depths() {
        let nested = UpstreamPayload::PlainJson(json!({
            "error": { "code": "X", "message": { "lang": "en", "value": "Posting period closed" } }
        }));
        assert_eq!(nested.error_message(400), "Posting period closed");

        let flat = UpstreamPayload::PlainJson(json!({ "error": { "message": "Forbidden" } }));
        assert_eq!(flat.error_message(403), "Forbidden");

        let top = UpstreamPayload::PlainJson(json!({ "message": "Rate limited" }));
        assert_eq!(top.error_message(429), "Rate limited");

        assert_eq!(
            UpstreamPayload::Empty.error_message(503),
            "SAP API returned status 503"
        );
    }

    #[test]
    fn serializes_camel_case_envelope() {
        let payload = UpstreamPayload::detect(r#"{"d":{"Success":true,"MatDoc":"1"}}"#);
        let body = serde_json::to_value(normalize(&payload, 201, "Post completed")).unwrap();

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["materialDocument"], json!("1"));
        assert_eq!(body["data"]["documentYear"], Value::Null);
        assert!(body.get("error").is_none());
    }
}
