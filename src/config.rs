use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use jsonwebtoken::Algorithm;
use thiserror::Error;

use crate::types::{
    DEFAULT_NONCE_CAPACITY, JWKS_CACHE_TTL_MS, MAX_TIMESTAMP_AGE_MS, NONCE_SWEEP_INTERVAL_MS,
    SENSITIVE_RATE_LIMIT, SENSITIVE_RATE_WINDOW_MS,
};

const DEFAULT_API_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_AUDIENCE: &str = "account";
const DEFAULT_PUBLIC_KEY_CLAIM: &str = "public_key";
const JWKS_PATH: &str = "/protocol/openid-connect/certs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuerConfig {
    pub issuer_url: String,
    pub client_id: String,
    pub audience: String,
    pub jwks_uri: String,
    pub jwks_cache_ttl_ms: u64,
    pub public_key_claim: String,
    pub algorithms: Vec<Algorithm>,
}

impl IssuerConfig {
    pub fn new(issuer_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        let issuer_url = issuer_url.into();
        Self {
            jwks_uri: format!("{}{JWKS_PATH}", issuer_url.trim_end_matches('/')),
            issuer_url,
            client_id: client_id.into(),
            audience: DEFAULT_AUDIENCE.to_string(),
            jwks_cache_ttl_ms: JWKS_CACHE_TTL_MS,
            public_key_claim: DEFAULT_PUBLIC_KEY_CLAIM.to_string(),
            algorithms: vec![Algorithm::RS256],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub api_addr: SocketAddr,
    pub issuer: IssuerConfig,
    pub max_timestamp_age_ms: i64,
    pub nonce_capacity: usize,
    pub nonce_sweep_interval_ms: u64,
    pub sensitive_rate_limit: u32,
    pub sensitive_rate_window_ms: i64,
}

impl GateConfig {
    pub fn new(issuer: IssuerConfig) -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            issuer,
            max_timestamp_age_ms: MAX_TIMESTAMP_AGE_MS,
            nonce_capacity: DEFAULT_NONCE_CAPACITY,
            nonce_sweep_interval_ms: NONCE_SWEEP_INTERVAL_MS,
            sensitive_rate_limit: SENSITIVE_RATE_LIMIT,
            sensitive_rate_window_ms: SENSITIVE_RATE_WINDOW_MS,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads settings through `lookup` so tests need not touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let issuer_url = get("STEPUP_ISSUER_URL").ok_or(ConfigError::Missing("STEPUP_ISSUER_URL"))?;
        let client_id = get("STEPUP_CLIENT_ID").ok_or(ConfigError::Missing("STEPUP_CLIENT_ID"))?;

        let mut issuer = IssuerConfig::new(issuer_url, client_id);
        if let Some(aud) = get("STEPUP_AUDIENCE") {
            issuer.audience = aud;
        }
        if let Some(uri) = get("STEPUP_JWKS_URI") {
            issuer.jwks_uri = uri;
        }
        if let Some(claim) = get("STEPUP_PUBLIC_KEY_CLAIM") {
            issuer.public_key_claim = claim;
        }
        if let Some(v) = get("STEPUP_JWKS_CACHE_MS") {
            issuer.jwks_cache_ttl_ms = parse("STEPUP_JWKS_CACHE_MS", &v)?;
        }
        if let Some(v) = get("STEPUP_JWT_ALGORITHMS") {
            issuer.algorithms = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse("STEPUP_JWT_ALGORITHMS", s))
                .collect::<Result<Vec<Algorithm>, _>>()?;
        }

        let mut cfg = GateConfig::new(issuer);
        cfg.api_addr = parse(
            "STEPUP_API_ADDR",
            &get("STEPUP_API_ADDR").unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        )?;
        if let Some(v) = get("STEPUP_MAX_TIMESTAMP_AGE_MS") {
            cfg.max_timestamp_age_ms = parse("STEPUP_MAX_TIMESTAMP_AGE_MS", &v)?;
        }
        if let Some(v) = get("STEPUP_NONCE_CAPACITY") {
            cfg.nonce_capacity = parse("STEPUP_NONCE_CAPACITY", &v)?;
        }
        if let Some(v) = get("STEPUP_NONCE_SWEEP_MS") {
            cfg.nonce_sweep_interval_ms = parse("STEPUP_NONCE_SWEEP_MS", &v)?;
        }
        if let Some(v) = get("STEPUP_SENSITIVE_RATE_LIMIT") {
            cfg.sensitive_rate_limit = parse("STEPUP_SENSITIVE_RATE_LIMIT", &v)?;
        }
        if let Some(v) = get("STEPUP_SENSITIVE_RATE_WINDOW_MS") {
            cfg.sensitive_rate_window_ms = parse("STEPUP_SENSITIVE_RATE_WINDOW_MS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.issuer_url.trim().is_empty() {
            return Err(ConfigError::Missing("STEPUP_ISSUER_URL"));
        }
        if self.issuer.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("STEPUP_CLIENT_ID"));
        }
        if self.issuer.algorithms.is_empty() {
            return Err(ConfigError::Missing("STEPUP_JWT_ALGORITHMS"));
        }
        if self.max_timestamp_age_ms <= 0 {
            return Err(invalid("STEPUP_MAX_TIMESTAMP_AGE_MS", self.max_timestamp_age_ms));
        }
        if self.nonce_capacity == 0 {
            return Err(invalid("STEPUP_NONCE_CAPACITY", self.nonce_capacity));
        }
        if self.nonce_sweep_interval_ms == 0 {
            return Err(invalid("STEPUP_NONCE_SWEEP_MS", self.nonce_sweep_interval_ms));
        }
        if self.sensitive_rate_window_ms <= 0 {
            return Err(invalid(
                "STEPUP_SENSITIVE_RATE_WINDOW_MS",
                self.sensitive_rate_window_ms,
            ));
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            issuer = %self.issuer.issuer_url,
            client_id = %self.issuer.client_id,
            audience = %self.issuer.audience,
            jwks_uri = %self.issuer.jwks_uri,
            jwks_cache_ms = self.issuer.jwks_cache_ttl_ms,
            max_timestamp_age_ms = self.max_timestamp_age_ms,
            nonce_capacity = self.nonce_capacity,
            "configuration validated"
        );
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn invalid(name: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}
