use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use moka::future::Cache;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::IssuerConfig;
use crate::errors::GateError;
use crate::types::{
    Principal, UnixMillis, JWKS_CACHE_CAPACITY, JWKS_MIN_REFETCH_MS, JWT_LEEWAY_SECS,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeySetError {
    #[error("key set fetch failed: {0}")]
    Fetch(String),
    #[error("no key with kid {0}")]
    UnknownKid(String),
    #[error("key {kid} unusable: {reason}")]
    InvalidKey { kid: String, reason: String },
}

#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, KeySetError>;
}

#[derive(Debug, Clone)]
pub struct StaticJwks {
    keys: JwkSet,
}

impl StaticJwks {
    pub fn new(keys: JwkSet) -> Self {
        Self { keys }
    }

    pub fn from_json(json: &str) -> Result<Self, KeySetError> {
        serde_json::from_str(json)
            .map(Self::new)
            .map_err(|e| KeySetError::Fetch(e.to_string()))
    }
}

#[async_trait]
impl JwksSource for StaticJwks {
    async fn fetch(&self) -> Result<JwkSet, KeySetError> {
        Ok(self.keys.clone())
    }
}

#[cfg(feature = "remote-http")]
pub struct HttpJwksSource {
    uri: String,
    client: reqwest::Client,
}

#[cfg(feature = "remote-http")]
impl HttpJwksSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "remote-http")]
#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet, KeySetError> {
        let resp = self
            .client
            .get(&self.uri)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| KeySetError::Fetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(KeySetError::Fetch(format!("status {}", resp.status())));
        }

        resp.json::<JwkSet>()
            .await
            .map_err(|e| KeySetError::Fetch(e.to_string()))
    }
}

struct Snapshot {
    fetched_at: UnixMillis,
    keys: Arc<JwkSet>,
}

// A kid miss reloads the key set at most once per refetch interval.
pub struct KeyCache {
    source: Arc<dyn JwksSource>,
    clock: Arc<dyn Clock>,
    keys: Cache<String, Arc<DecodingKey>>,
    last_fetch: Mutex<Option<Snapshot>>,
    min_refetch_ms: i64,
}

impl KeyCache {
    pub fn new(source: Arc<dyn JwksSource>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            source,
            clock,
            keys: Cache::builder()
                .max_capacity(JWKS_CACHE_CAPACITY)
                .time_to_live(Duration::from_millis(ttl_ms))
                .build(),
            last_fetch: Mutex::new(None),
            min_refetch_ms: JWKS_MIN_REFETCH_MS,
        }
    }

    pub async fn key_for(&self, kid: &str) -> Result<Arc<DecodingKey>, Arc<KeySetError>> {
        self.keys
            .try_get_with(kid.to_string(), self.load(kid))
            .await
    }

    async fn load(&self, kid: &str) -> Result<Arc<DecodingKey>, KeySetError> {
        let keys = self.key_set().await?;
        let jwk = keys
            .find(kid)
            .ok_or_else(|| KeySetError::UnknownKid(kid.to_string()))?;
        DecodingKey::from_jwk(jwk)
            .map(Arc::new)
            .map_err(|e| KeySetError::InvalidKey {
                kid: kid.to_string(),
                reason: e.to_string(),
            })
    }

    async fn key_set(&self) -> Result<Arc<JwkSet>, KeySetError> {
        let mut last = self.last_fetch.lock().await;
        let now = self.clock.now_ms();

        if let Some(snap) = last.as_ref() {
            if now - snap.fetched_at < self.min_refetch_ms {
                return Ok(snap.keys.clone());
            }
        }

        tracing::debug!("fetching issuer key set");
        let keys = Arc::new(self.source.fetch().await?);
        *last = Some(Snapshot {
            fetched_at: now,
            keys: keys.clone(),
        });
        Ok(keys)
    }
}

pub struct IdentityVerifier {
    config: IssuerConfig,
    keys: KeyCache,
}

impl IdentityVerifier {
    pub fn new(config: IssuerConfig, source: Arc<dyn JwksSource>, clock: Arc<dyn Clock>) -> Self {
        let keys = KeyCache::new(source, clock, config.jwks_cache_ttl_ms);
        Self { config, keys }
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    pub async fn verify(&self, authorization: Option<&str>) -> Result<Principal, GateError> {
        let token = bearer_token(authorization).ok_or(GateError::AccessTokenRequired)?;

        let header = decode_header(token).map_err(|e| {
            tracing::debug!(error = %e, "unparseable token header");
            GateError::JwtInvalidSignature
        })?;
        let kid = header.kid.ok_or(GateError::JwtInvalidSignature)?;

        let key = self.keys.key_for(&kid).await.map_err(|e| {
            tracing::warn!(kid = %kid, error = %e, "signing key unavailable");
            GateError::JwtInvalidSignature
        })?;

        let data = decode::<Map<String, Value>>(token, &key, &self.validation())
            .map_err(|e| map_jwt_error(e.kind()))?;

        principal_from_claims(data.claims, &self.config)
    }

    fn validation(&self) -> Validation {
        let mut v = Validation::default();
        v.algorithms = self.config.algorithms.clone();
        v.leeway = JWT_LEEWAY_SECS;
        v.validate_nbf = true;
        v.set_issuer(&[self.config.issuer_url.as_str()]);
        v.set_audience(&[self.config.audience.as_str()]);
        v
    }
}

fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let (scheme, token) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn map_jwt_error(kind: &JwtErrorKind) -> GateError {
    match kind {
        JwtErrorKind::ExpiredSignature => GateError::JwtExpired,
        JwtErrorKind::ImmatureSignature => GateError::JwtNotYetValid,
        JwtErrorKind::InvalidIssuer => GateError::JwtInvalidClaims("issuer mismatch"),
        JwtErrorKind::InvalidAudience => GateError::JwtInvalidClaims("audience mismatch"),
        JwtErrorKind::MissingRequiredClaim(_) => GateError::JwtInvalidClaims("missing required claim"),
        other => {
            tracing::debug!(error = ?other, "token rejected");
            GateError::JwtInvalidSignature
        }
    }
}

fn non_empty_str<'a>(claims: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn principal_from_claims(
    claims: Map<String, Value>,
    config: &IssuerConfig,
) -> Result<Principal, GateError> {
    let sub = non_empty_str(&claims, "sub").ok_or(GateError::JwtInvalidClaims("missing sub"))?;

    if claims.get("azp").and_then(Value::as_str) != Some(config.client_id.as_str()) {
        return Err(GateError::JwtInvalidClient);
    }

    let public_key = non_empty_str(&claims, &config.public_key_claim)
        .ok_or(GateError::PublicKeyNotFound)?
        .to_string();

    let subject_id = non_empty_str(&claims, "email")
        .or_else(|| non_empty_str(&claims, "preferred_username"))
        .unwrap_or(sub)
        .to_string();

    Ok(Principal {
        subject_id,
        public_key,
        issuer_claims: claims.into_iter().collect::<BTreeMap<_, _>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &[u8] = b"stepup-gate-test-hmac-secret-0123456789abx";
    const SECRET_B64: &str = "c3RlcHVwLWdhdGUtdGVzdC1obWFjLXNlY3JldC0wMTIzNDU2Nzg5YWJ4";
    const ISSUER: &str = "https://auth.example.com/realms/demo";

    struct CountingSource {
        inner: StaticJwks,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JwksSource for CountingSource {
        async fn fetch(&self) -> Result<JwkSet, KeySetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch().await
        }
    }

    fn jwks() -> StaticJwks {
        StaticJwks::from_json(
            &json!({"keys": [{"kty": "oct", "kid": "k1", "alg": "HS256", "k": SECRET_B64}]})
                .to_string(),
        )
        .unwrap()
    }

    fn issuer() -> IssuerConfig {
        let mut cfg = IssuerConfig::new(ISSUER, "agent-app");
        cfg.algorithms = vec![Algorithm::HS256];
        cfg
    }

    fn token(kid: &str, claims: Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn claims() -> Value {
        let now = chrono::Utc::now().timestamp();
        json!({
            "sub": "user-1",
            "azp": "agent-app",
            "aud": "account",
            "iss": ISSUER,
            "exp": now + 300,
            "iat": now,
            "preferred_username": "alice",
            "public_key": "0x0000000000000000000000000000000000000001",
        })
    }

    fn with(mut base: Value, key: &str, value: Value) -> Value {
        base[key] = value;
        base
    }

    fn without(mut base: Value, key: &str) -> Value {
        base.as_object_mut().unwrap().remove(key);
        base
    }

    fn verifier(source: Arc<dyn JwksSource>, clock: Arc<ManualClock>) -> IdentityVerifier {
        IdentityVerifier::new(issuer(), source, clock)
    }

    async fn check(claims: Value) -> Result<Principal, GateError> {
        let v = verifier(Arc::new(jwks()), Arc::new(ManualClock::new(0)));
        let header = format!("Bearer {}", token("k1", claims));
        v.verify(Some(&header)).await
    }

    #[tokio::test]
    async fn valid_token_yields_principal() {
        let p = check(claims()).await.unwrap();
        assert_eq!(p.subject_id, "alice");
        assert_eq!(p.public_key, "0x0000000000000000000000000000000000000001");
        assert_eq!(p.issuer_claims["sub"], json!("user-1"));
    }

    #[tokio::test]
    async fn email_wins_over_username() {
        let p = check(with(claims(), "email", json!("alice@example.com")))
            .await
            .unwrap();
        assert_eq!(p.subject_id, "alice@example.com");

        let p = check(without(claims(), "preferred_username")).await.unwrap();
        assert_eq!(p.subject_id, "user-1");
    }

    #[tokio::test]
    async fn missing_or_empty_credential_is_required() {
        let v = verifier(Arc::new(jwks()), Arc::new(ManualClock::new(0)));
        for header in [None, Some(""), Some("Bearer"), Some("Bearer   "), Some("Basic abc")] {
            assert_eq!(v.verify(header).await.unwrap_err(), GateError::AccessTokenRequired);
        }
    }

    #[tokio::test]
    async fn token_failures_map_to_distinct_kinds() {
        let now = chrono::Utc::now().timestamp();

        assert_eq!(
            check(with(claims(), "exp", json!(now - 3600))).await.unwrap_err(),
            GateError::JwtExpired
        );
        assert_eq!(
            check(with(claims(), "nbf", json!(now + 3600))).await.unwrap_err(),
            GateError::JwtNotYetValid
        );
        assert!(matches!(
            check(with(claims(), "iss", json!("https://evil"))).await.unwrap_err(),
            GateError::JwtInvalidClaims(_)
        ));
        assert!(matches!(
            check(with(claims(), "aud", json!("other"))).await.unwrap_err(),
            GateError::JwtInvalidClaims(_)
        ));
        assert_eq!(
            check(with(claims(), "azp", json!("other-app"))).await.unwrap_err(),
            GateError::JwtInvalidClient
        );
        assert_eq!(
            check(without(claims(), "public_key")).await.unwrap_err(),
            GateError::PublicKeyNotFound
        );
    }

    #[tokio::test]
    async fn sub_is_checked_before_azp_and_public_key() {
        let c = without(without(without(claims(), "sub"), "azp"), "public_key");
        assert!(matches!(
            check(c).await.unwrap_err(),
            GateError::JwtInvalidClaims(_)
        ));
        let c = without(without(claims(), "azp"), "public_key");
        assert_eq!(check(c).await.unwrap_err(), GateError::JwtInvalidClient);
    }

    #[tokio::test]
    async fn tampered_or_unkeyed_tokens_fail_signature() {
        let v = verifier(Arc::new(jwks()), Arc::new(ManualClock::new(0)));

        let good = token("k1", claims());
        let (head, _) = good.rsplit_once('.').unwrap();
        let forged = format!("Bearer {head}.AAAA");
        assert_eq!(v.verify(Some(&forged)).await.unwrap_err(), GateError::JwtInvalidSignature);

        let unknown = format!("Bearer {}", token("k9", claims()));
        assert_eq!(v.verify(Some(&unknown)).await.unwrap_err(), GateError::JwtInvalidSignature);

        assert_eq!(
            v.verify(Some("Bearer not.a.jwt")).await.unwrap_err(),
            GateError::JwtInvalidSignature
        );
    }

    #[tokio::test]
    async fn key_set_loads_are_cached_and_rate_limited() {
        let source = Arc::new(CountingSource {
            inner: jwks(),
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(1_000));
        let v = verifier(source.clone(), clock.clone());

        let good = format!("Bearer {}", token("k1", claims()));
        v.verify(Some(&good)).await.unwrap();
        v.verify(Some(&good)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // A random kid right after a load is answered from the last set.
        let unknown = format!("Bearer {}", token("rotated", claims()));
        assert!(v.verify(Some(&unknown)).await.is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        clock.advance(JWKS_MIN_REFETCH_MS);
        let unknown = format!("Bearer {}", token("rotated-2", claims()));
        assert!(v.verify(Some(&unknown)).await.is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_load() {
        struct Slow(CountingSource);

        #[async_trait]
        impl JwksSource for Slow {
            async fn fetch(&self) -> Result<JwkSet, KeySetError> {
                tokio::time::sleep(Duration::from_millis(25)).await;
                self.0.fetch().await
            }
        }

        let source = Arc::new(Slow(CountingSource {
            inner: jwks(),
            calls: AtomicUsize::new(0),
        }));
        let v = Arc::new(verifier(source.clone(), Arc::new(ManualClock::new(1_000))));
        let header = format!("Bearer {}", token("k1", claims()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let v = v.clone();
                let header = header.clone();
                tokio::spawn(async move { v.verify(Some(&header)).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(source.0.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_key_set_fails_closed() {
        struct Down;

        #[async_trait]
        impl JwksSource for Down {
            async fn fetch(&self) -> Result<JwkSet, KeySetError> {
                Err(KeySetError::Fetch("connection refused".into()))
            }
        }

        let v = verifier(Arc::new(Down), Arc::new(ManualClock::new(0)));
        let header = format!("Bearer {}", token("k1", claims()));
        assert_eq!(v.verify(Some(&header)).await.unwrap_err(), GateError::JwtInvalidSignature);
    }
}
