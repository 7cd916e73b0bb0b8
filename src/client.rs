use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use rand_core::{OsRng, RngCore};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::{build_message, sort_keys};
use crate::endpoints::EndpointRegistry;
use crate::errors::{ErrorKind, GateError};
use crate::signature::{self, address_of, format_address};
use crate::types::{strip_envelope_fields, Params, SignedActionEnvelope, UnixMillis};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("user declined to sign the approval message")]
    SignatureDeclined,
    #[error("could not build approval message: {0}")]
    Message(#[from] GateError),
    #[error("request rejected with {status} {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Rejected { code, .. } => ErrorKind::parse(code),
            _ => None,
        }
    }
}

/// Something that can show the approval message to a user and return their
/// `personal_sign` signature. `None` means the user declined.
#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign(&self, message: &str) -> Option<String>;
}

pub struct LocalKeySigner {
    sk: SigningKey,
}

impl LocalKeySigner {
    pub fn new(sk: SigningKey) -> Self {
        Self { sk }
    }

    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut OsRng))
    }

    pub fn address(&self) -> String {
        format_address(&address_of(self.sk.verifying_key()))
    }

    pub fn public_key_hex(&self, compressed: bool) -> String {
        signature::public_key_hex(self.sk.verifying_key(), compressed)
    }
}

#[async_trait]
impl MessageSigner for LocalKeySigner {
    async fn sign(&self, message: &str) -> Option<String> {
        match signature::sign_personal(&self.sk, message) {
            Ok(sig) => Some(sig),
            Err(e) => {
                tracing::warn!(error = %e, "local signing failed");
                None
            }
        }
    }
}

pub fn generate_nonce() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub async fn sign_envelope(
    registry: &EndpointRegistry,
    signer: &dyn MessageSigner,
    method: &str,
    path: &str,
    params: &Params,
    timestamp: UnixMillis,
    nonce: String,
) -> Result<SignedActionEnvelope, ClientError> {
    let clean = match sort_keys(&Value::Object(strip_envelope_fields(params))) {
        Value::Object(map) => map,
        _ => Params::new(),
    };
    let message = build_message(registry, method, path, &clean, timestamp)?;
    let signature = signer
        .sign(&message)
        .await
        .ok_or(ClientError::SignatureDeclined)?;

    Ok(SignedActionEnvelope {
        action_params: clean,
        timestamp,
        nonce,
        signature,
    })
}

#[cfg(feature = "remote-http")]
pub use http::StepUpClient;

#[cfg(feature = "remote-http")]
mod http {
    use std::sync::Arc;

    use reqwest::{Method, StatusCode};
    use serde_json::Value;

    use super::{generate_nonce, sign_envelope, ClientError, MessageSigner};
    use crate::clock::{Clock, SystemClock};
    use crate::endpoints::EndpointRegistry;
    use crate::errors::ErrorKind;
    use crate::types::Params;

    pub struct StepUpClient {
        base_url: String,
        access_token: String,
        signer: Arc<dyn MessageSigner>,
        registry: Arc<EndpointRegistry>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
    }

    impl StepUpClient {
        pub fn new(
            base_url: impl Into<String>,
            access_token: impl Into<String>,
            signer: Arc<dyn MessageSigner>,
        ) -> Self {
            Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                access_token: access_token.into(),
                signer,
                registry: Arc::new(EndpointRegistry::with_default_catalog()),
                clock: Arc::new(SystemClock),
                http: reqwest::Client::new(),
            }
        }

        pub fn with_registry(mut self, registry: Arc<EndpointRegistry>) -> Self {
            self.registry = registry;
            self
        }

        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        pub async fn call(&self, method: &str, path: &str, params: Params) -> Result<Value, ClientError> {
            let (status, body) = self.send(method, path, &Value::Object(params.clone())).await?;
            if status.is_success() {
                return Ok(body);
            }

            let code = body.get("error").and_then(Value::as_str).unwrap_or_default();
            if status != StatusCode::FORBIDDEN || ErrorKind::parse(code) != Some(ErrorKind::SignatureRequired) {
                return Err(rejection(status, &body));
            }

            if let Some(action) = body.pointer("/requiredApproval/action").and_then(Value::as_str) {
                tracing::info!(endpoint = %path, action = %action, "approval requested");
            }

            let envelope = sign_envelope(
                &self.registry,
                self.signer.as_ref(),
                method,
                path,
                &params,
                self.clock.now_ms(),
                generate_nonce(),
            )
            .await?;

            let (status, body) = self.send(method, path, &envelope.into_body()).await?;
            if status.is_success() {
                Ok(body)
            } else {
                Err(rejection(status, &body))
            }
        }

        async fn send(&self, method: &str, path: &str, body: &Value) -> Result<(StatusCode, Value), ClientError> {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            let resp = self
                .http
                .request(method, format!("{}{}", self.base_url, path))
                .bearer_auth(&self.access_token)
                .json(body)
                .send()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let status = resp.status();
            let body = resp
                .json::<Value>()
                .await
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            Ok((status, body))
        }
    }

    fn rejection(status: StatusCode, body: &Value) -> ClientError {
        let field = |name: &str| body.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        ClientError::Rejected {
            status: status.as_u16(),
            code: field("error"),
            message: field("message"),
        }
    }
}
