// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::path::PathBuf;
use std::time::Duration;

use ca_client::{CaClientConfig, ProviderKind};
use clap::Parser;

use crate::cache::CacheOptions;
use crate::constants::{
    DEFAULT_CA_ENDPOINT, DEFAULT_EVICTION_DURATION, DEFAULT_MAX_STREAMS, DEFAULT_ROTATION_GRACE,
    DEFAULT_ROTATION_INTERVAL, DEFAULT_SDS_UDS_PATH, DEFAULT_SECRET_TTL,
};
use crate::errors::AppError;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct AgentOptions {
    #[arg(long, default_value = DEFAULT_SDS_UDS_PATH, env("NODE_AGENT_SDS_UDS_PATH"))]
    pub sds_uds_path: PathBuf,
    #[arg(long, env("NODE_AGENT_SDS_CERT_FILE"))]
    pub sds_cert_file: Option<PathBuf>,
    #[arg(long, env("NODE_AGENT_SDS_KEY_FILE"))]
    pub sds_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_SECRET_TTL.as_secs(), env("NODE_AGENT_SECRET_TTL_SECS"))]
    pub secret_ttl_secs: u64,
    #[arg(long, default_value_t = DEFAULT_ROTATION_INTERVAL.as_secs(), env("NODE_AGENT_ROTATION_INTERVAL_SECS"))]
    pub rotation_interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_ROTATION_GRACE.as_secs(), env("NODE_AGENT_ROTATION_GRACE_SECS"))]
    pub rotation_grace_secs: u64,
    #[arg(long, default_value_t = DEFAULT_EVICTION_DURATION.as_secs(), env("NODE_AGENT_EVICTION_DURATION_SECS"))]
    pub eviction_duration_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_STREAMS, env("NODE_AGENT_MAX_STREAMS"))]
    pub max_streams: usize,
    #[arg(long, default_value = DEFAULT_CA_ENDPOINT, env("NODE_AGENT_CA_ENDPOINT"))]
    pub ca_endpoint: String,
    #[arg(long, value_enum, default_value_t = ProviderKind::Citadel, env("NODE_AGENT_CA_PROVIDER"))]
    pub ca_provider: ProviderKind,
    #[arg(long, env("NODE_AGENT_CA_ROOT_CERT"))]
    pub ca_root_cert: Option<PathBuf>,
    #[arg(long, env("NODE_AGENT_CA_TOKEN_FILE"))]
    pub ca_token_file: Option<PathBuf>,
    #[arg(long, default_value_t = 10, env("NODE_AGENT_CA_TIMEOUT_SECS"))]
    pub ca_timeout_secs: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            sds_uds_path: PathBuf::from(DEFAULT_SDS_UDS_PATH),
            sds_cert_file: None,
            sds_key_file: None,
            secret_ttl_secs: DEFAULT_SECRET_TTL.as_secs(),
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL.as_secs(),
            rotation_grace_secs: DEFAULT_ROTATION_GRACE.as_secs(),
            eviction_duration_secs: DEFAULT_EVICTION_DURATION.as_secs(),
            max_streams: DEFAULT_MAX_STREAMS,
            ca_endpoint: DEFAULT_CA_ENDPOINT.to_string(),
            ca_provider: ProviderKind::Citadel,
            ca_root_cert: None,
            ca_token_file: None,
            ca_timeout_secs: 10,
        }
    }
}

impl AgentOptions {
    /// Rejects option combinations the agent cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.rotation_interval_secs == 0 {
            return Err(AppError::ConfigError(
                "rotation interval must be greater than zero".to_string(),
            ));
        }
        if self.secret_ttl_secs == 0 {
            return Err(AppError::ConfigError(
                "secret TTL must be greater than zero".to_string(),
            ));
        }
        if self.max_streams == 0 {
            return Err(AppError::ConfigError(
                "max streams must be greater than zero".to_string(),
            ));
        }
        match (&self.sds_cert_file, &self.sds_key_file) {
            (Some(_), None) | (None, Some(_)) => Err(AppError::ConfigError(
                "SDS TLS requires both a certificate and a key file".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            secret_ttl: Duration::from_secs(self.secret_ttl_secs),
            rotation_interval: Duration::from_secs(self.rotation_interval_secs),
            rotation_grace: Duration::from_secs(self.rotation_grace_secs),
            eviction_duration: Duration::from_secs(self.eviction_duration_secs),
        }
    }

    pub fn ca_config(&self) -> CaClientConfig {
        let mut config = CaClientConfig::new(self.ca_endpoint.clone(), self.ca_provider);
        config.root_cert = self.ca_root_cert.clone();
        config.token_file = self.ca_token_file.clone();
        config.timeout = Duration::from_secs(self.ca_timeout_secs);
        config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_parser() {
        let parsed = AgentOptions::try_parse_from(["node-agent"]).unwrap();
        let default = AgentOptions::default();
        assert_eq!(parsed.sds_uds_path, default.sds_uds_path);
        assert_eq!(parsed.rotation_interval_secs, 600);
        assert_eq!(parsed.rotation_grace_secs, 900);
        assert_eq!(parsed.eviction_duration_secs, 86400);
        assert_eq!(parsed.max_streams, 100_000);
        assert_eq!(parsed.ca_provider, ProviderKind::Citadel);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_parse_flags() {
        let options = AgentOptions::try_parse_from([
            "node-agent",
            "--sds-uds-path",
            "/tmp/sds.sock",
            "--ca-provider",
            "google-ca",
            "--ca-endpoint",
            "https://ca.example.com",
            "--ca-token-file",
            "/var/run/token",
            "--ca-timeout-secs",
            "3",
        ])
        .unwrap();

        let config = options.ca_config();
        assert_eq!(config.provider, ProviderKind::GoogleCa);
        assert_eq!(config.endpoint, "https://ca.example.com");
        assert_eq!(config.token_file, Some(PathBuf::from("/var/run/token")));
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(options.sds_uds_path, PathBuf::from("/tmp/sds.sock"));
    }

    #[test]
    fn test_cache_options() {
        let options = AgentOptions {
            secret_ttl_secs: 120,
            rotation_interval_secs: 5,
            rotation_grace_secs: 30,
            eviction_duration_secs: 60,
            ..AgentOptions::default()
        };
        let cache = options.cache_options();
        assert_eq!(cache.secret_ttl, Duration::from_secs(120));
        assert_eq!(cache.rotation_interval, Duration::from_secs(5));
        assert_eq!(cache.rotation_grace, Duration::from_secs(30));
        assert_eq!(cache.eviction_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_rotation_interval() {
        let options = AgentOptions {
            rotation_interval_secs: 0,
            ..AgentOptions::default()
        };
        assert!(matches!(options.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_validate_requires_cert_and_key_together() {
        let cert_only = AgentOptions {
            sds_cert_file: Some(PathBuf::from("/etc/sds/cert.pem")),
            ..AgentOptions::default()
        };
        assert!(matches!(cert_only.validate(), Err(AppError::ConfigError(_))));

        let both = AgentOptions {
            sds_key_file: Some(PathBuf::from("/etc/sds/key.pem")),
            ..cert_only
        };
        assert!(both.validate().is_ok());
    }
}
