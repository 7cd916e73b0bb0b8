#![cfg(feature = "remote-http")]

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};
use stepup_gate::{
    endpoints, web_api, ClientError, ErrorKind, GateConfig, IssuerConfig, LocalKeySigner,
    MessageSigner, StaticJwks, StepUpClient, SystemClock,
};

const SECRET: &[u8] = b"stepup-gate-test-hmac-secret-0123456789abx";
const SECRET_B64: &str = "c3RlcHVwLWdhdGUtdGVzdC1obWFjLXNlY3JldC0wMTIzNDU2Nzg5YWJ4";
const ISSUER: &str = "https://auth.example.com/realms/agents";

struct DeclineAll;

#[async_trait]
impl MessageSigner for DeclineAll {
    async fn sign(&self, _message: &str) -> Option<String> {
        None
    }
}

async fn spawn_gate() -> String {
    let mut issuer = IssuerConfig::new(ISSUER, "agent-console");
    issuer.algorithms = vec![Algorithm::HS256];
    let config = GateConfig::new(issuer);
    let jwks = StaticJwks::from_json(
        &json!({"keys": [{"kty": "oct", "kid": "realm-key", "alg": "HS256", "k": SECRET_B64}]})
            .to_string(),
    )
    .unwrap();
    let state = web_api::AppState::new(&config, Arc::new(jwks), Arc::new(SystemClock));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, web_api::build_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn token_for(signer: &LocalKeySigner) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = json!({
        "sub": "user-7",
        "azp": "agent-console",
        "aud": "account",
        "iss": ISSUER,
        "iat": now,
        "exp": now + 600,
        "preferred_username": "operator",
        "public_key": signer.public_key_hex(true),
    });
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("realm-key".into());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn params(v: Value) -> serde_json::Map<String, Value> {
    v.as_object().cloned().unwrap()
}

#[tokio::test]
async fn client_signs_and_resubmits_over_http() {
    let base = spawn_gate().await;
    let signer = Arc::new(LocalKeySigner::new(SigningKey::from_slice(&[33u8; 32]).unwrap()));
    let client = StepUpClient::new(&base, token_for(&signer), signer.clone());

    let body = client
        .call(
            "POST",
            endpoints::MODIFY_PERMISSIONS,
            params(json!({"userId": "u-19", "permissions": ["admin", "export_data"], "action": "grant"})),
        )
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(
        body["data"]["audit"]["actionDescription"],
        "Grant permissions [\"admin\",\"export_data\"] for user \"u-19\""
    );
    assert_eq!(body["data"]["audit"]["subjectId"], "operator");
}

#[tokio::test]
async fn declined_signature_stops_the_exchange() {
    let base = spawn_gate().await;
    let wallet = LocalKeySigner::new(SigningKey::from_slice(&[34u8; 32]).unwrap());
    let client = StepUpClient::new(&base, token_for(&wallet), Arc::new(DeclineAll));

    let err = client
        .call("POST", endpoints::DEPLOY_CODE, params(json!({"environment": "production"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SignatureDeclined));
}

#[tokio::test]
async fn gate_rejections_surface_as_client_errors() {
    let base = spawn_gate().await;
    let wallet = LocalKeySigner::new(SigningKey::from_slice(&[35u8; 32]).unwrap());
    let client = StepUpClient::new(&base, "not-a-token", Arc::new(wallet));

    let err = client
        .call("POST", endpoints::BULK_EXPORT, params(json!({"query": "q", "destination": "d"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::JwtInvalidSignature));
    assert!(matches!(err, ClientError::Rejected { status: 401, .. }));
}
