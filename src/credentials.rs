//! Per-request caller identity decoded from the inbound headers.

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::AppError;

pub const USER_AUTH_HEADER: &str = "x-user-auth";
pub const USER_ENVIRONMENT_HEADER: &str = "x-user-environment";

const DEFAULT_ENVIRONMENT: &str = "110";

/// Basic-auth pair forwarded to SAP.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Who is calling and which SAP system they target. Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub credentials: Credentials,
    pub environment: String,
}

impl CallerIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let encoded = headers
            .get(USER_AUTH_HEADER)
            .ok_or(AppError::CredentialsRequired)?
            .to_str()
            .map_err(|_| AppError::InvalidCredentials)?;

        Ok(Self {
            credentials: decode_basic(encoded)?,
            environment: environment_tag(headers),
        })
    }
}

/// The raw environment tag, defaulting to the development client when absent.
pub fn environment_tag(headers: &HeaderMap) -> String {
    headers
        .get(USER_ENVIRONMENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_ENVIRONMENT)
        .to_string()
}

fn decode_basic(encoded: &str) -> Result<Credentials, AppError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AppError::InvalidCredentials)?;
    let decoded = String::from_utf8(bytes).map_err(|_| AppError::InvalidCredentials)?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or(AppError::InvalidCredentials)?;

    if username.is_empty() || password.is_empty() {
        return Err(AppError::InvalidCredentials);
    }

    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(auth: Option<&str>, env: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(auth) = auth {
            map.insert(USER_AUTH_HEADER, HeaderValue::from_str(auth).unwrap());
        }
        if let Some(env) = env {
            map.insert(USER_ENVIRONMENT_HEADER, HeaderValue::from_str(env).unwrap());
        }
        map
    }

    #[test]
    fn decodes_user_and_environment() {
        let token = STANDARD.encode("jdoe:s3cret");
        let caller = CallerIdentity::from_headers(&headers(Some(&token), Some("prd"))).unwrap();

        assert_eq!(caller.credentials.username, "jdoe");
        assert_eq!(caller.credentials.password, "s3cret");
        assert_eq!(caller.environment, "prd");
    }

    #[test]
    fn defaults_environment_to_development_client() {
        let token = STANDARD.encode("jdoe:s3cret");
        let caller = CallerIdentity::from_headers(&headers(Some(&token), None)).unwrap();

        assert_eq!(caller.environment, "110");
    }

    #[test]
    fn password_may_contain_colons() {
        let token = STANDARD.encode("jdoe:a:b:c");
        let caller = CallerIdentity::from_headers(&headers(Some(&token), None)).unwrap();

        assert_eq!(caller.credentials.password, "a:b:c");
    }

    #[test]
    fn missing_header_requires_credentials() {
        let err = CallerIdentity::from_headers(&headers(None, Some("dev"))).unwrap_err();
        assert!(matches!(err, AppError::CredentialsRequired));
    }

    #[test]
    fn rejects_malformed_values() {
        let cases = [
            "not base64!!".to_string(),
            STANDARD.encode("no-separator"),
            STANDARD.encode(":password"),
            STANDARD.encode("user:"),
        ];

        for case in cases {
            let err = CallerIdentity::from_headers(&headers(Some(&case), None)).unwrap_err();
            assert!(matches!(err, AppError::InvalidCredentials), "{case}");
        }
    }

    #[test]
    fn debug_output_hides_password() {
        let token = STANDARD.encode("jdoe:s3cret");
        let caller = CallerIdentity::from_headers(&headers(Some(&token), None)).unwrap();

        assert!(!format!("{caller:?}").contains("s3cret"));
    }
}
