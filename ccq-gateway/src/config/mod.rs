use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use ccq_auth::Environment;
use ccq_auth::Permissions;
use ccq_auth::PolicySet;
use ccq_auth::QuerySigner;
use ccq_messages::ChainId;
use config::FileFormat;
use lazy_static_include::*;
use redact::Secret;
use serde_derive::Deserialize;
use tracing::debug;

use crate::dispatcher::DispatcherSettings;
use crate::dispatcher::SignatureMode;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub chains: Vec<ChainConfig>,
    pub permissions: Vec<PermissionConfig>,
    pub prometheus: PrometheusConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    pub signature_mode: SignatureMode,

    /// Hex private key used to sign responses, and unsigned requests in optional mode.
    pub signer_key: Option<Secret<String>>,

    pub query_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl GatewayConfig {
    pub fn validate(&self) {
        assert!(self.query_timeout_ms > 0, "Query timeout is required");
        assert!(
            self.request_timeout_ms >= self.query_timeout_ms,
            "Request timeout must not be shorter than the query timeout"
        );
        if self.signature_mode == SignatureMode::Optional {
            assert!(
                self.signer_key.is_some(),
                "Signer key is required when signatures are optional"
            );
        }
        if let Some(key) = &self.signer_key {
            assert!(!key.expose_secret().is_empty(), "Signer key value is empty");
        }
    }

    pub fn settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            environment: self.environment,
            signature_mode: self.signature_mode,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn signer(&self) -> anyhow::Result<Option<QuerySigner>> {
        self.signer_key
            .as_ref()
            .map(|key| QuerySigner::from_hex(key.expose_secret()).context("parsing signer key"))
            .transpose()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub rpc_url: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PermissionConfig {
    pub user_name: String,
    pub api_key: Secret<String>,
    pub allowed_calls: Vec<String>,
    pub allowed_signers: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PrometheusConfig {
    pub port: u16,
}

impl Config {
    pub fn load(local_file: Option<String>) -> Config {
        Self::try_load(local_file).expect("Could not load configuration")
    }

    pub fn try_load(local_file: Option<String>) -> anyhow::Result<Config> {
        let mut config_builder = config::Config::builder();
        config_builder =
            config_builder.add_source(config::File::from_str(&DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(local_file) = local_file {
            debug!("Loading local configuration from {}", local_file);
            config_builder = config_builder.add_source(config::File::with_name(&local_file));
        }

        config_builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn validate(&self) {
        self.gateway.validate();

        let mut chains = HashSet::new();
        for chain in &self.chains {
            assert!(
                chains.insert(chain.chain_id),
                "Chain {} is configured twice",
                chain.chain_id
            );
            assert!(
                !chain.rpc_url.is_empty(),
                "RPC URL is required. chain_id: {}",
                chain.chain_id
            );
        }

        for permission in &self.permissions {
            assert!(!permission.user_name.is_empty(), "User name is required");
            assert!(
                !permission.api_key.expose_secret().is_empty(),
                "API key is required. user_name: {}",
                permission.user_name
            );
        }
    }

    /// Builds the api key table from the `permissions` section.
    pub fn policy_set(&self) -> anyhow::Result<PolicySet> {
        let mut policy = PolicySet::new();
        for entry in &self.permissions {
            let permissions = Permissions::parse(
                entry.user_name.clone(),
                entry.allowed_calls.as_slice(),
                entry.allowed_signers.as_deref(),
            )
            .with_context(|| format!("parsing permissions of {}", entry.user_name))?;
            policy.insert(entry.api_key.expose_secret().trim(), permissions)?;
        }
        Ok(policy)
    }
}
