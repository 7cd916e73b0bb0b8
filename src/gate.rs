use std::sync::Arc;

use serde_json::Value;

use crate::canonical::{build_message, message_digest};
use crate::clock::Clock;
use crate::endpoints::EndpointRegistry;
use crate::errors::GateError;
use crate::nonce::{NonceStore, RecordOutcome};
use crate::signature;
use crate::types::{
    strip_envelope_fields, ApprovalRequest, AuditRecord, Params, Principal, UnixMillis,
    FIELD_NONCE, FIELD_SIGNATURE, FIELD_TIMESTAMP, MAX_TIMESTAMP_AGE_MS, MIN_NONCE_LEN,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Admitted(AuditRecord),
    SignatureRequired(ApprovalRequest),
    Rejected(GateError),
}

impl GateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateDecision::Admitted(_))
    }
}

/// Decides whether a sensitive request carries a fresh, unused, valid
/// signature from the authenticated caller.
pub struct AuthorizationGate {
    ledger: Arc<dyn NonceStore>,
    registry: Arc<EndpointRegistry>,
    clock: Arc<dyn Clock>,
    max_age_ms: i64,
}

impl AuthorizationGate {
    pub fn new(
        ledger: Arc<dyn NonceStore>,
        registry: Arc<EndpointRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            registry,
            clock,
            max_age_ms: MAX_TIMESTAMP_AGE_MS,
        }
    }

    pub fn with_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_age_ms = max_age_ms;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn NonceStore> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn max_age_ms(&self) -> i64 {
        self.max_age_ms
    }

    pub fn evaluate(
        &self,
        principal: Option<&Principal>,
        method: &str,
        path: &str,
        body: &Value,
    ) -> GateDecision {
        let subject = principal.map(|p| p.subject_id.as_str()).unwrap_or("-");
        match self.check(principal, method, path, body) {
            Ok(decision) => {
                match &decision {
                    GateDecision::Admitted(audit) => tracing::info!(
                        subject = %audit.subject_id,
                        endpoint = %path,
                        risk = audit.risk_level.as_str(),
                        "signed request admitted"
                    ),
                    GateDecision::SignatureRequired(req) => tracing::info!(
                        subject = %subject,
                        endpoint = %path,
                        risk = req.risk_level.as_str(),
                        "signature required"
                    ),
                    GateDecision::Rejected(_) => {}
                }
                decision
            }
            Err(err) => {
                tracing::warn!(
                    subject = %subject,
                    endpoint = %path,
                    error = %err.kind(),
                    nonce = %nonce_prefix(body),
                    "signed request rejected"
                );
                GateDecision::Rejected(err)
            }
        }
    }

    fn check(
        &self,
        principal: Option<&Principal>,
        method: &str,
        path: &str,
        body: &Value,
    ) -> Result<GateDecision, GateError> {
        let principal = principal.ok_or(GateError::AuthenticationError)?;

        let empty = Params::new();
        let params = match body {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(GateError::InvalidRequestBody),
        };

        let signature = match params.get(FIELD_SIGNATURE) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => {
                return Err(GateError::MalformedSignedMessage(
                    "signature must be a string".to_string(),
                ))
            }
        };

        let action = self.registry.describe(path, &strip_envelope_fields(params));
        let risk_level = self.registry.risk_level(path);

        let Some(signature) = signature else {
            return Ok(GateDecision::SignatureRequired(ApprovalRequest {
                action,
                risk_level,
                endpoint: path.to_string(),
            }));
        };

        let now = self.clock.now_ms();
        let timestamp = params
            .get(FIELD_TIMESTAMP)
            .and_then(parse_timestamp)
            .ok_or(GateError::RequestExpired)?;
        if (i128::from(now) - i128::from(timestamp)).abs() > i128::from(self.max_age_ms) {
            return Err(GateError::RequestExpired);
        }

        let nonce = match params.get(FIELD_NONCE) {
            Some(Value::String(n)) if n.chars().count() >= MIN_NONCE_LEN => n.as_str(),
            _ => return Err(GateError::InvalidNonce),
        };

        let expires_at = timestamp.saturating_add(self.max_age_ms);
        match self.ledger.try_record(nonce, expires_at, now) {
            RecordOutcome::Recorded => {}
            RecordOutcome::Reused => return Err(GateError::NonceReused),
            RecordOutcome::Saturated => return Err(GateError::NonceLedgerSaturated),
        }

        let message = build_message(&self.registry, method, path, params, timestamp)?;
        if !signature::verify(&message, signature, &principal.public_key) {
            return Err(GateError::SignatureVerificationFailed);
        }

        Ok(GateDecision::Admitted(AuditRecord {
            signature: signature.to_string(),
            message_digest: message_digest(&message),
            action_description: action,
            endpoint: path.to_string(),
            method: method.to_ascii_uppercase(),
            signed_timestamp: timestamp,
            verification_timestamp: now,
            risk_level,
            subject_id: principal.subject_id.clone(),
        }))
    }
}

/// Millisecond timestamp from an integer, a float (truncated) or a decimal string.
pub fn parse_timestamp(value: &Value) -> Option<UnixMillis> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(truncate))
        }
        _ => None,
    }
}

fn truncate(f: f64) -> Option<i64> {
    if !f.is_finite() {
        return None;
    }
    let t = f.trunc();
    (t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}

fn nonce_prefix(body: &Value) -> String {
    body.get(FIELD_NONCE)
        .and_then(Value::as_str)
        .map(|n| n.chars().take(MIN_NONCE_LEN).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::endpoints::{BULK_EXPORT, MODIFY_PERMISSIONS};
    use crate::errors::ErrorKind;
    use crate::nonce::NonceLedger;
    use crate::types::RiskLevel;
    use k256::ecdsa::SigningKey;
    use serde_json::json;
    use std::collections::BTreeMap;

    const NOW: i64 = 1_705_314_600_000;

    struct Fixture {
        gate: AuthorizationGate,
        clock: Arc<ManualClock>,
        sk: SigningKey,
        principal: Principal,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let gate = AuthorizationGate::new(
            Arc::new(NonceLedger::new(16)),
            Arc::new(EndpointRegistry::with_default_catalog()),
            clock.clone(),
        );
        let sk = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let principal = Principal {
            subject_id: "alice@example.com".into(),
            public_key: signature::public_key_hex(sk.verifying_key(), true),
            issuer_claims: BTreeMap::new(),
        };
        Fixture {
            gate,
            clock,
            sk,
            principal,
        }
    }

    fn export_params() -> Value {
        json!({"query": "SELECT * FROM users", "destination": "ops@example.com", "format": "CSV"})
    }

    fn signed(f: &Fixture, params: Value, ts: i64, nonce: &str) -> Value {
        let Value::Object(map) = params else { unreachable!() };
        let message = build_message(&f.gate.registry, "POST", BULK_EXPORT, &map, ts).unwrap();
        let sig = signature::sign_personal(&f.sk, &message).unwrap();
        let mut body = map;
        body.insert("timestamp".into(), json!(ts));
        body.insert("nonce".into(), json!(nonce));
        body.insert("signature".into(), json!(sig));
        Value::Object(body)
    }

    fn kind(d: GateDecision) -> ErrorKind {
        match d {
            GateDecision::Rejected(e) => e.kind(),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn unsigned_request_gets_approval_request() {
        let f = fixture();
        let d = f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &export_params());
        assert_eq!(
            d,
            GateDecision::SignatureRequired(ApprovalRequest {
                action: "Export data: \"SELECT * FROM users\" to destination \"ops@example.com\""
                    .into(),
                risk_level: RiskLevel::High,
                endpoint: BULK_EXPORT.into(),
            })
        );

        let blank = json!({"userId": "u1", "permissions": ["admin"], "action": "grant", "signature": "  "});
        match f.gate.evaluate(Some(&f.principal), "POST", MODIFY_PERMISSIONS, &blank) {
            GateDecision::SignatureRequired(req) => {
                assert_eq!(req.action, "Grant permissions [\"admin\"] for user \"u1\"");
                assert_eq!(req.risk_level, RiskLevel::Critical);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_path_defaults_to_high_risk() {
        let f = fixture();
        match f.gate.evaluate(Some(&f.principal), "POST", "/api/sensitive/other", &Value::Null) {
            GateDecision::SignatureRequired(req) => {
                assert_eq!(req.action, "Perform sensitive action: /api/sensitive/other");
                assert_eq!(req.risk_level, RiskLevel::High);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signed_request_is_admitted_once() {
        let f = fixture();
        let body = signed(&f, export_params(), NOW - 1_000, "nonce-0001");

        let d = f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &body);
        let GateDecision::Admitted(audit) = d else { panic!("expected admission") };
        assert_eq!(audit.subject_id, "alice@example.com");
        assert_eq!(audit.signed_timestamp, NOW - 1_000);
        assert_eq!(audit.verification_timestamp, NOW);
        assert_eq!(audit.method, "POST");
        assert_eq!(audit.message_digest.len(), 64);

        let again = f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &body);
        assert_eq!(kind(again), ErrorKind::NonceReused);
    }

    #[test]
    fn freshness_window_is_inclusive() {
        let f = fixture();
        let window = f.gate.max_age_ms();

        let edge = signed(&f, export_params(), NOW - window, "nonce-edge");
        assert!(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &edge).is_admitted());

        let stale = signed(&f, export_params(), NOW - window - 1, "nonce-old1");
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &stale)),
            ErrorKind::RequestExpired
        );

        let future = signed(&f, export_params(), NOW + window + 1, "nonce-fut1");
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &future)),
            ErrorKind::RequestExpired
        );
    }

    #[test]
    fn timestamp_accepts_float_and_string_forms() {
        assert_eq!(parse_timestamp(&json!(1700.9)), Some(1700));
        assert_eq!(parse_timestamp(&json!(" 1700 ")), Some(1700));
        assert_eq!(parse_timestamp(&json!("1700.5")), Some(1700));
        assert_eq!(parse_timestamp(&json!("soon")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn tampered_parameters_fail_verification() {
        let f = fixture();
        let mut body = signed(&f, export_params(), NOW, "nonce-tamp");
        body["destination"] = json!("attacker@evil.example");
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &body)),
            ErrorKind::SignatureVerificationFailed
        );
    }

    #[test]
    fn signature_from_another_key_fails() {
        let f = fixture();
        let body = signed(&f, export_params(), NOW, "nonce-keyb");
        let other = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let mallory = Principal {
            public_key: signature::public_key_hex(other.verifying_key(), false),
            ..f.principal.clone()
        };
        assert_eq!(
            kind(f.gate.evaluate(Some(&mallory), "POST", BULK_EXPORT, &body)),
            ErrorKind::SignatureVerificationFailed
        );
    }

    #[test]
    fn malformed_inputs_are_rejected_before_verification() {
        let f = fixture();

        assert_eq!(
            kind(f.gate.evaluate(None, "POST", BULK_EXPORT, &export_params())),
            ErrorKind::AuthenticationError
        );
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &json!([1, 2]))),
            ErrorKind::InvalidRequestBody
        );
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &json!({"signature": 5}))),
            ErrorKind::MalformedSignedMessage
        );

        let short = signed(&f, export_params(), NOW, "short");
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &short)),
            ErrorKind::InvalidNonce
        );

        let mut no_ts = signed(&f, export_params(), NOW, "nonce-nots");
        no_ts.as_object_mut().unwrap().remove("timestamp");
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &no_ts)),
            ErrorKind::RequestExpired
        );
    }

    #[test]
    fn nonce_is_burned_even_when_verification_fails() {
        let f = fixture();
        let mut body = signed(&f, export_params(), NOW, "nonce-burn");
        body["signature"] = json!(format!("0x{}", "11".repeat(65)));
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &body)),
            ErrorKind::SignatureVerificationFailed
        );
        assert!(f.gate.ledger().has("nonce-burn", NOW));

        let good = signed(&f, export_params(), NOW, "nonce-burn");
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &good)),
            ErrorKind::NonceReused
        );
    }

    #[test]
    fn nonce_becomes_reusable_after_window() {
        let f = fixture();
        let body = signed(&f, export_params(), NOW, "nonce-late");
        assert!(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &body).is_admitted());

        let window = f.gate.max_age_ms();
        f.clock.advance(window + 1);
        f.gate.ledger().purge_expired(NOW + window + 1);
        assert!(!f.gate.ledger().has("nonce-late", NOW + window + 1));

        // The old envelope itself is now stale.
        assert_eq!(
            kind(f.gate.evaluate(Some(&f.principal), "POST", BULK_EXPORT, &body)),
            ErrorKind::RequestExpired
        );
    }
}
