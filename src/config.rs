use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use crate::credentials::Credentials;

const DEFAULT_DEV_BASE_URL: &str = "https://10.200.11.37:44300";
const DEFAULT_PRD_BASE_URL: &str = "https://10.200.10.115:44300";
const DEFAULT_MIGO_SERVICE_PATH: &str = "/sap/opu/odata/sap/ZMM_MIGO_SRV";
const DEFAULT_BATCH_SERVICE_PATH: &str = "/sap/opu/odata/sap/ZUM_BSP_BATCH_INFORMATION_SRV";
const DEFAULT_DEV_MIGO_CSRF_URL: &str =
    "https://devspace.test.apimanagement.eu10.hana.ondemand.com/bsp/migo";
const DEFAULT_DEV_MIGO_POST_URL: &str =
    "https://devspace.test.apimanagement.eu10.hana.ondemand.com/bsp/migo/TransferHeaderSet";
const DEFAULT_PRD_MIGO_CSRF_URL: &str =
    "https://prdspace.prod01.apimanagement.eu10.hana.ondemand.com/bsp/prd/migo";
const DEFAULT_PRD_MIGO_POST_URL: &str =
    "https://prdspace.prod01.apimanagement.eu10.hana.ondemand.com/bsp/prd/migo/TransferHeaderSet";
const DEFAULT_DEV_BATCH_URL: &str =
    "https://devspace.test.apimanagement.eu10.hana.ondemand.com/bsp/batch";
const DEFAULT_PRD_BATCH_URL: &str =
    "https://prdspace.prod01.apimanagement.eu10.hana.ondemand.com/bsp/prd/batch/BatchInfoSet";

/// A CSRF-fetch URL paired with the write URL that consumes the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPair {
    pub csrf_url: String,
    pub post_url: String,
}

/// Optional API-management settings backing the raw `/gateway/*` routes.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub migo_url: String,
    pub migo_post_url: String,
}

#[derive(Debug, Clone)]
pub struct SapConfig {
    pub dev_base_url: String,
    pub prd_base_url: String,
    pub migo_service_path: String,
    pub batch_service_path: String,
    pub dev_gateway: EndpointPair,
    pub prd_gateway: EndpointPair,
    pub dev_batch_url: String,
    pub prd_batch_url: String,
    pub gateway: Option<GatewayConfig>,
    /// Technical user for reads that do not carry caller credentials.
    pub service_account: Option<Credentials>,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub accept_invalid_certs: bool,
}

pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub sap: SapConfig,
    pub diagnostics: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("BSP_PROXY_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5000".to_string())
            .parse()
            .context("invalid BSP_PROXY_ADDR")?;

        let diagnostics = parse_bool("BSP_PROXY_DIAGNOSTICS", false)?;

        Ok(Self {
            listen_addr,
            sap: SapConfig::from_env()?,
            diagnostics,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

impl SapConfig {
    pub fn from_env() -> Result<Self> {
        let gateway_migo_url = optional("SAP_API_MGMT_MIGO_URL");
        let gateway_migo_post_url = optional("SAP_API_MGMT_MIGO_POST_URL");

        let dev_gateway = EndpointPair {
            csrf_url: optional("DEV_MIGO_CSRF_URL")
                .or_else(|| gateway_migo_url.clone())
                .unwrap_or_else(|| DEFAULT_DEV_MIGO_CSRF_URL.to_string()),
            post_url: optional("DEV_MIGO_POST_URL")
                .or_else(|| gateway_migo_post_url.clone())
                .unwrap_or_else(|| DEFAULT_DEV_MIGO_POST_URL.to_string()),
        };

        let prd_gateway = EndpointPair {
            csrf_url: or_default("PRD_MIGO_CSRF_URL", DEFAULT_PRD_MIGO_CSRF_URL),
            post_url: or_default("PRD_MIGO_POST_URL", DEFAULT_PRD_MIGO_POST_URL),
        };

        let gateway = match (optional("SAP_API_MGMT_URL"), gateway_migo_url, gateway_migo_post_url) {
            (Some(base_url), Some(migo_url), Some(migo_post_url)) => Some(GatewayConfig {
                base_url,
                migo_url,
                migo_post_url,
            }),
            (Some(_), _, _) => {
                tracing::warn!(
                    "SAP_API_MGMT_URL is set but the MIGO gateway URLs are missing; gateway routes disabled"
                );
                None
            }
            _ => None,
        };

        let service_account = match (optional("SAP_USER"), optional("SAP_PASS")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        let config = Self {
            dev_base_url: or_default("SAP_BASE_URL", DEFAULT_DEV_BASE_URL),
            prd_base_url: or_default("SAP_PRD_BASE_URL", DEFAULT_PRD_BASE_URL),
            migo_service_path: or_default("MIGO_SERVICE_PATH", DEFAULT_MIGO_SERVICE_PATH),
            batch_service_path: or_default("BSP_SERVICE_PATH", DEFAULT_BATCH_SERVICE_PATH),
            dev_gateway,
            prd_gateway,
            dev_batch_url: or_default("SAP_API_MGMT_BATCH_URL", DEFAULT_DEV_BATCH_URL),
            prd_batch_url: or_default("PRD_300_BATCH_URL", DEFAULT_PRD_BATCH_URL),
            gateway,
            service_account,
            timeout: parse_duration("SAP_TIMEOUT_SECONDS", 30)?,
            probe_timeout: parse_duration("SAP_PROBE_TIMEOUT_SECONDS", 10)?,
            accept_invalid_certs: parse_bool("SAP_ACCEPT_INVALID_CERTS", true)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Every configured endpoint must be an absolute http(s) URL.
    pub fn validate(&self) -> Result<()> {
        let mut urls = vec![
            ("SAP_BASE_URL", self.dev_base_url.as_str()),
            ("SAP_PRD_BASE_URL", self.prd_base_url.as_str()),
            ("DEV_MIGO_CSRF_URL", self.dev_gateway.csrf_url.as_str()),
            ("DEV_MIGO_POST_URL", self.dev_gateway.post_url.as_str()),
            ("PRD_MIGO_CSRF_URL", self.prd_gateway.csrf_url.as_str()),
            ("PRD_MIGO_POST_URL", self.prd_gateway.post_url.as_str()),
            ("SAP_API_MGMT_BATCH_URL", self.dev_batch_url.as_str()),
            ("PRD_300_BATCH_URL", self.prd_batch_url.as_str()),
        ];
        if let Some(gateway) = &self.gateway {
            urls.push(("SAP_API_MGMT_URL", gateway.base_url.as_str()));
            urls.push(("SAP_API_MGMT_MIGO_URL", gateway.migo_url.as_str()));
            urls.push(("SAP_API_MGMT_MIGO_POST_URL", gateway.migo_post_url.as_str()));
        }

        for (env_key, raw) in urls {
            let parsed = Url::parse(raw).with_context(|| format!("{env_key} is not a valid URL"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("{env_key} must use http or https, got {}", parsed.scheme());
            }
        }

        Ok(())
    }
}

impl Default for SapConfig {
    fn default() -> Self {
        Self {
            dev_base_url: DEFAULT_DEV_BASE_URL.to_string(),
            prd_base_url: DEFAULT_PRD_BASE_URL.to_string(),
            migo_service_path: DEFAULT_MIGO_SERVICE_PATH.to_string(),
            batch_service_path: DEFAULT_BATCH_SERVICE_PATH.to_string(),
            dev_gateway: EndpointPair {
                csrf_url: DEFAULT_DEV_MIGO_CSRF_URL.to_string(),
                post_url: DEFAULT_DEV_MIGO_POST_URL.to_string(),
            },
            prd_gateway: EndpointPair {
                csrf_url: DEFAULT_PRD_MIGO_CSRF_URL.to_string(),
                post_url: DEFAULT_PRD_MIGO_POST_URL.to_string(),
            },
            dev_batch_url: DEFAULT_DEV_BATCH_URL.to_string(),
            prd_batch_url: DEFAULT_PRD_BATCH_URL.to_string(),
            gateway: None,
            service_account: None,
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            accept_invalid_certs: true,
        }
    }
}

fn optional(env_key: &str) -> Option<String> {
    env::var(env_key).ok().filter(|value| !value.trim().is_empty())
}

fn or_default(env_key: &str, default: &str) -> String {
    optional(env_key).unwrap_or_else(|| default.to_string())
}

fn parse_duration(env_key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env::var(env_key).unwrap_or_else(|_| default_secs.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{env_key} must be an integer number of seconds"))?;

    Ok(Duration::from_secs(secs))
}

fn parse_bool(env_key: &str, default: bool) -> Result<bool> {
    match env::var(env_key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow::anyhow!("{env_key} must be a boolean, got {other:?}")),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SapConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_relative_and_non_http_urls() {
        let mut config = SapConfig::default();
        config.prd_base_url = "10.200.10.115:44300".into();
        assert!(config.validate().is_err());

        let mut config = SapConfig::default();
        config.dev_gateway.post_url = "ftp://host/migo".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DEV_MIGO_POST_URL"));
    }

    #[test]
    fn boolean_flags_accept_common_spellings() {
        std::env::set_var("BSP_PROXY_TEST_FLAG", "Yes");
        assert!(parse_bool("BSP_PROXY_TEST_FLAG", false).unwrap());
        std::env::set_var("BSP_PROXY_TEST_FLAG", "off");
        assert!(!parse_bool("BSP_PROXY_TEST_FLAG", true).unwrap());
        std::env::set_var("BSP_PROXY_TEST_FLAG", "maybe");
        assert!(parse_bool("BSP_PROXY_TEST_FLAG", true).is_err());
        std::env::remove_var("BSP_PROXY_TEST_FLAG");
        assert!(parse_bool("BSP_PROXY_TEST_FLAG", true).unwrap());
    }
}
