use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_TIMESTAMP_AGE_MS: i64 = 15 * 60 * 1000;
pub const MIN_NONCE_LEN: usize = 8;
pub const DEFAULT_NONCE_CAPACITY: usize = 100_000;
pub const NONCE_SWEEP_INTERVAL_MS: u64 = 60 * 1000;

pub const SENSITIVE_RATE_LIMIT: u32 = 10;
pub const SENSITIVE_RATE_WINDOW_MS: i64 = 15 * 60 * 1000;

pub const JWKS_CACHE_TTL_MS: u64 = 10 * 60 * 1000;
pub const JWKS_MIN_REFETCH_MS: i64 = 12 * 1000;
pub const JWKS_CACHE_CAPACITY: u64 = 64;
pub const JWT_LEEWAY_SECS: u64 = 60;

pub const MAX_BODY_BYTES: usize = 1024 * 1024;

// Envelope fields that never take part in the signed message body.
pub const FIELD_SIGNATURE: &str = "signature";
pub const FIELD_NONCE: &str = "nonce";
pub const FIELD_TIMESTAMP: &str = "timestamp";

pub type Params = Map<String, Value>;
pub type UnixMillis = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    Regular,
    Sensitive,
}

#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub subject_id: String,
    pub public_key: String,
    pub issuer_claims: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub action: String,
    pub risk_level: RiskLevel,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub signature: String,
    pub message_digest: String,
    pub action_description: String,
    pub endpoint: String,
    pub method: String,
    pub signed_timestamp: UnixMillis,
    pub verification_timestamp: UnixMillis,
    pub risk_level: RiskLevel,
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedActionEnvelope {
    pub action_params: Params,
    pub timestamp: UnixMillis,
    pub nonce: String,
    pub signature: String,
}

impl SignedActionEnvelope {
    pub fn into_body(self) -> Value {
        let mut body = self.action_params;
        body.insert(FIELD_TIMESTAMP.to_string(), Value::from(self.timestamp));
        body.insert(FIELD_NONCE.to_string(), Value::String(self.nonce));
        body.insert(FIELD_SIGNATURE.to_string(), Value::String(self.signature));
        Value::Object(body)
    }
}

pub fn strip_envelope_fields(params: &Params) -> Params {
    params
        .iter()
        .filter(|(k, _)| {
            k.as_str() != FIELD_SIGNATURE && k.as_str() != FIELD_NONCE && k.as_str() != FIELD_TIMESTAMP
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
