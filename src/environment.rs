// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Maps an environment tag onto concrete SAP endpoints.
//!
//! `110`/`dev` and `300`/`prd` are aliases; anything else is treated as a
//! custom SAP client code routed like development.

use std::fmt;
use std::sync::Arc;

use crate::config::{EndpointPair, SapConfig};

const DEV_CLIENT: &str = "110";
const PRD_CLIENT: &str = "300";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prd,
    Custom(String),
}

impl Environment {
    pub fn normalize(tag: &str) -> Self {
        match tag {
            "110" | "dev" => Environment::Dev,
            "300" | "prd" => Environment::Prd,
            other => Environment::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Environment::Dev => "dev",
            Environment::Prd => "prd",
            Environment::Custom(tag) => tag,
        }
    }

    pub fn sap_client(&self) -> &str {
        match self {
            Environment::Dev => DEV_CLIENT,
            Environment::Prd => PRD_CLIENT,
            Environment::Custom(tag) => tag,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Prd)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a write reaches SAP for a given environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Gateway only; a CSRF failure is terminal.
    GatewayOnly(EndpointPair),
    /// Gateway first, then the direct backend once.
    GatewayThenDirect {
        gateway: EndpointPair,
        direct: EndpointPair,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub environment: Environment,
    pub base_url: String,
    pub sap_client: String,
    pub is_production: bool,
    pub plan: DispatchPlan,
}

impl Resolution {
    /// Endpoints of the first attempt.
    pub fn primary(&self) -> &EndpointPair {
        match &self.plan {
            DispatchPlan::GatewayOnly(pair) => pair,
            DispatchPlan::GatewayThenDirect { gateway, .. } => gateway,
        }
    }

    pub fn csrf_url(&self) -> &str {
        &self.primary().csrf_url
    }

    pub fn post_url(&self) -> &str {
        &self.primary().post_url
    }
}

/// Pure lookup over the startup configuration.
#[derive(Clone)]
pub struct EnvironmentResolver {
    config: Arc<SapConfig>,
}

impl EnvironmentResolver {
    pub fn new(config: Arc<SapConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SapConfig {
        &self.config
    }

    pub fn resolve(&self, tag: &str) -> Resolution {
        let environment = Environment::normalize(tag);
        let base_url = self.base_url(&environment).to_string();
        let sap_client = environment.sap_client().to_string();
        let is_production = environment.is_production();

        let plan = if is_production {
            DispatchPlan::GatewayOnly(self.config.prd_gateway.clone())
        } else {
            DispatchPlan::GatewayThenDirect {
                gateway: self.config.dev_gateway.clone(),
                direct: self.direct_migo(&base_url),
            }
        };

        Resolution {
            environment,
            base_url,
            sap_client,
            is_production,
            plan,
        }
    }

    pub fn base_url(&self, environment: &Environment) -> &str {
        match environment {
            Environment::Prd => &self.config.prd_base_url,
            Environment::Dev | Environment::Custom(_) => &self.config.dev_base_url,
        }
    }

    /// Root of the direct MIGO service for `environment`.
    pub fn migo_service_root(&self, environment: &Environment) -> String {
        join_url(self.base_url(environment), &self.config.migo_service_path)
    }

    /// Root of the direct batch-information service for `environment`.
    pub fn batch_service_root(&self, environment: &Environment) -> String {
        join_url(self.base_url(environment), &self.config.batch_service_path)
    }

    fn direct_migo(&self, base_url: &str) -> EndpointPair {
        let entity_set = join_url(
            &join_url(base_url, &self.config.migo_service_path),
            "TransferHeaderSet",
        );
        EndpointPair {
            csrf_url: entity_set.clone(),
            post_url: entity_set,
        }
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> EnvironmentResolver {
        EnvironmentResolver::new(Arc::new(SapConfig::default()))
    }

    #[test]
    fn aliases_collapse_to_canonical_environments() {
        for tag in ["110", "dev"] {
            assert_eq!(Environment::normalize(tag), Environment::Dev);
        }
        for tag in ["300", "prd"] {
            assert_eq!(Environment::normalize(tag), Environment::Prd);
        }
    }

    #[test]
    fn unknown_tags_pass_through() {
        for tag in ["200", "qas", "PRD", ""] {
            assert_eq!(Environment::normalize(tag).as_str(), tag);
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        for tag in ["110", "dev", "300", "prd", "500", "sandbox"] {
            let once = Environment::normalize(tag);
            let twice = Environment::normalize(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn production_uses_the_gateway_only() {
        let resolution = resolver().resolve("300");
        let config = SapConfig::default();

        assert!(resolution.is_production);
        assert_eq!(resolution.sap_client, "300");
        assert_eq!(resolution.plan, DispatchPlan::GatewayOnly(config.prd_gateway.clone()));
        assert_eq!(resolution.csrf_url(), config.prd_gateway.csrf_url);
    }

    #[test]
    fn development_falls_back_to_the_direct_service() {
        let resolution = resolver().resolve("dev");
        let config = SapConfig::default();

        assert!(!resolution.is_production);
        assert_eq!(resolution.sap_client, "110");
        match resolution.plan {
            DispatchPlan::GatewayThenDirect { gateway, direct } => {
                assert_eq!(gateway, config.dev_gateway);
                assert_eq!(
                    direct.post_url,
                    format!(
                        "{}{}/TransferHeaderSet",
                        config.dev_base_url, config.migo_service_path
                    )
                );
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn custom_client_codes_route_like_development() {
        let resolution = resolver().resolve("200");

        assert!(!resolution.is_production);
        assert_eq!(resolution.sap_client, "200");
        assert_eq!(resolution.base_url, SapConfig::default().dev_base_url);
    }

    #[test]
    fn joins_urls_without_doubled_slashes() {
        assert_eq!(join_url("https://h/", "/a/b"), "https://h/a/b");
        assert_eq!(join_url("https://h", "a"), "https://h/a");
        assert_eq!(join_url("https://h/", ""), "https://h");
    }
}
