use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde_json::{json, Value};

use crate::canonical::iso_timestamp;
use crate::clock::Clock;
use crate::config::GateConfig;
use crate::endpoints::{
    EndpointRegistry, BULK_EXPORT, DEPLOY_CODE, EXTERNAL_COMMUNICATION, FINANCIAL_TRANSACTION,
    MODIFY_PERMISSIONS, SYSTEM_STATUS,
};
use crate::errors::{ErrorKind, GateError};
use crate::gate::{AuthorizationGate, GateDecision};
use crate::identity::{IdentityVerifier, JwksSource};
use crate::nonce::{NonceLedger, NonceStore};
use crate::ratelimit::RateLimiter;
use crate::types::{
    strip_envelope_fields, ApprovalRequest, AuditRecord, Params, Principal, MAX_BODY_BYTES,
};

pub const HEALTH: &str = "/health";
pub const ENDPOINT_CATALOG: &str = "/api/endpoints";

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; frame-ancestors 'none'";

// Parameters of an admitted envelope, handed to the business handler as parsed by the gate.
#[derive(Clone)]
struct AdmittedParams(Params);

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<IdentityVerifier>,
    pub gate: Arc<AuthorizationGate>,
    pub registry: Arc<EndpointRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: &GateConfig, jwks: Arc<dyn JwksSource>, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(EndpointRegistry::with_default_catalog());
        let ledger: Arc<dyn NonceStore> = Arc::new(NonceLedger::new(config.nonce_capacity));
        let gate = AuthorizationGate::new(ledger, registry.clone(), clock.clone())
            .with_max_age_ms(config.max_timestamp_age_ms);

        Self {
            identity: Arc::new(IdentityVerifier::new(
                config.issuer.clone(),
                jwks,
                clock.clone(),
            )),
            gate: Arc::new(gate),
            registry,
            limiter: Arc::new(RateLimiter::new(
                config.sensitive_rate_limit,
                config.sensitive_rate_window_ms,
            )),
            clock,
        }
    }

    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let ledger = self.gate.ledger().clone();
        let limiter = self.limiter.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let now = clock.now_ms();
                let purged = ledger.purge_expired(now);
                limiter.purge_idle(now);
                if purged > 0 {
                    tracing::debug!(purged, remaining = ledger.len(), "nonce sweep");
                }
            }
        })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct SuccessResponse<T: Serialize> {
    success: bool,
    data: T,
    message: String,
}

impl<T: Serialize> SuccessResponse<T> {
    fn new(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            message: message.into(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureRequiredResponse {
    success: bool,
    error: ErrorKind,
    message: &'static str,
    required_approval: ApprovalRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotFoundResponse {
    success: bool,
    error: ErrorKind,
    message: String,
    available_endpoints: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationReceipt {
    operation_id: String,
    endpoint: String,
    parameters: Value,
    audit: AuditRecord,
}

fn now_iso(state: &AppState) -> String {
    iso_timestamp(state.clock.now_ms()).unwrap_or_default()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        service: "stepup-gate",
        timestamp: now_iso(&state),
    })
}

async fn system_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> impl IntoResponse {
    SuccessResponse::new(
        json!({
            "status": "operational",
            "timestamp": now_iso(&state),
            "requestedBy": principal.subject_id,
            "trackedNonces": state.gate.ledger().len(),
            "registeredEndpoints": state.registry.len(),
        }),
        "System status retrieved",
    )
}

async fn list_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    let (sensitive, regular): (Vec<_>, Vec<_>) = state.registry.iter().partition(|d| d.is_sensitive());
    SuccessResponse::new(
        json!({ "regular": regular, "sensitive": sensitive }),
        "Endpoint catalog",
    )
}

fn operation_id() -> String {
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);
    format!("op_{}", hex::encode(buf))
}

async fn sensitive_operation(
    Extension(audit): Extension<AuditRecord>,
    Extension(AdmittedParams(parameters)): Extension<AdmittedParams>,
) -> impl IntoResponse {
    let message = format!("Approved: {}", audit.action_description);
    SuccessResponse::new(
        OperationReceipt {
            operation_id: operation_id(),
            endpoint: audit.endpoint.clone(),
            parameters: Value::Object(parameters),
            audit,
        },
        message,
    )
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

async fn not_found(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    if is_api_path(uri.path()) {
        let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        if let Err(err) = state.identity.verify(authorization).await {
            tracing::warn!(endpoint = %uri.path(), error = %err.kind(), "authentication failed");
            return err.into_response();
        }
    }

    let err = GateError::EndpointNotFound(uri.path().to_string());
    let mut available = vec![format!("GET {HEALTH}"), format!("GET {ENDPOINT_CATALOG}")];
    available.extend(state.registry.iter().map(|d| format!("{} {}", d.method, d.path)));
    (
        err.status(),
        Json(NotFoundResponse {
            success: false,
            error: err.kind(),
            message: err.to_string(),
            available_endpoints: available,
        }),
    )
        .into_response()
}

async fn authenticate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    match state.identity.verify(authorization.as_deref()).await {
        Ok(principal) => {
            tracing::debug!(subject = %principal.subject_id, "bearer token accepted");
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => {
            tracing::warn!(endpoint = %req.uri().path(), error = %err.kind(), "authentication failed");
            err.into_response()
        }
    }
}

async fn limit_sensitive(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(subject) = req.extensions().get::<Principal>().map(|p| p.subject_id.clone()) else {
        return GateError::AuthenticationError.into_response();
    };
    if !state.limiter.check(&subject, state.clock.now_ms()) {
        tracing::warn!(subject = %subject, endpoint = %req.uri().path(), "sensitive rate limit hit");
        return GateError::RateLimitExceeded.into_response();
    }
    next.run(req).await
}

fn reject_body(principal: Option<&Principal>, endpoint: &str, reason: &str) -> Response {
    let err = GateError::InvalidRequestBody;
    tracing::warn!(
        subject = principal.map(|p| p.subject_id.as_str()).unwrap_or("-"),
        endpoint = %endpoint,
        error = %err.kind(),
        reason = %reason,
        "request body rejected"
    );
    err.into_response()
}

async fn require_signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let principal = parts.extensions.get::<Principal>().cloned();

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return reject_body(principal.as_ref(), parts.uri.path(), &e.to_string()),
    };

    let value = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(v) => v,
            Err(e) => return reject_body(principal.as_ref(), parts.uri.path(), &e.to_string()),
        }
    };

    let decision = state.gate.evaluate(
        principal.as_ref(),
        parts.method.as_str(),
        parts.uri.path(),
        &value,
    );

    match decision {
        GateDecision::Admitted(audit) => {
            let params = match &value {
                Value::Object(map) => strip_envelope_fields(map),
                _ => Params::new(),
            };
            parts.extensions.insert(AdmittedParams(params));
            parts.extensions.insert(audit);
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        GateDecision::SignatureRequired(approval) => (
            StatusCode::FORBIDDEN,
            Json(SignatureRequiredResponse {
                success: false,
                error: ErrorKind::SignatureRequired,
                message: "This operation requires wallet signature approval",
                required_approval: approval,
            }),
        )
            .into_response(),
        GateDecision::Rejected(err) => err.into_response(),
    }
}

async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    resp
}

pub fn build_router(state: AppState) -> Router {
    let sensitive: Router<AppState> = Router::new()
        .route(BULK_EXPORT, post(sensitive_operation))
        .route(EXTERNAL_COMMUNICATION, post(sensitive_operation))
        .route(MODIFY_PERMISSIONS, post(sensitive_operation))
        .route(FINANCIAL_TRANSACTION, post(sensitive_operation))
        .route(DEPLOY_CODE, post(sensitive_operation))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_signature))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_sensitive));

    let api: Router<AppState> = Router::new()
        .route(SYSTEM_STATUS, get(system_status))
        .route(ENDPOINT_CATALOG, get(list_endpoints))
        .merge(sensitive)
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route(HEALTH, get(health))
        .merge(api)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn run_http_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "stepup gate listening");
    axum::serve(listener, build_router(state)).await
}
