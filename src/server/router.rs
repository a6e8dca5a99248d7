//! HTTP router and protocol handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::cert::IdentityCertificate;
use crate::certauth::{
    CertAuth, CertAuthError, CertAuthPipeline, VerifiedCertificate, bad_request,
    certauth_middleware,
};
use crate::webhook::{
    Event, EventSink, TOPIC_AUTHENTICATE, TOPIC_CHECK_OUT, TOPIC_TOKEN_UPDATE,
};

/// Shared application state
pub struct AppState {
    /// Association rules
    pub certauth: Arc<CertAuth>,
    /// Event destination
    pub events: Arc<dyn EventSink>,
    /// Largest body a handler reads
    pub max_body_size: usize,
}

/// Create the router.
///
/// Every route except `/health` sits behind the certificate pipeline.
pub fn create_router(
    state: Arc<AppState>,
    pipeline: Arc<CertAuthPipeline>,
    request_timeout: Duration,
) -> Router {
    Router::new()
        .route("/enroll/{enrollment_id}", post(enroll_handler))
        .route("/checkin/{enrollment_id}", put(checkin_handler))
        .route("/checkout/{enrollment_id}", put(checkout_handler))
        .route("/connect/{enrollment_id}", put(connect_handler))
        .route_layer(middleware::from_fn_with_state(pipeline, certauth_middleware))
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /enroll/{enrollment_id}: bind the presented certificate.
async fn enroll_handler(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<String>,
    request: Request,
) -> Response {
    let (certificate, body) = match read_request(&state, request).await {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    if let Err(e) = state.certauth.authenticate(&enrollment_id, &certificate).await {
        return rejection(&enrollment_id, &e);
    }

    state
        .events
        .emit(Event::checkin(TOPIC_AUTHENTICATE, &enrollment_id, body.to_vec()));
    StatusCode::OK.into_response()
}

/// PUT /checkin/{enrollment_id}: token update from an enrolled device.
async fn checkin_handler(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<String>,
    request: Request,
) -> Response {
    checked_checkin(&state, &enrollment_id, TOPIC_TOKEN_UPDATE, request).await
}

/// PUT /checkout/{enrollment_id}: device is unenrolling.
async fn checkout_handler(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<String>,
    request: Request,
) -> Response {
    checked_checkin(&state, &enrollment_id, TOPIC_CHECK_OUT, request).await
}

async fn checked_checkin(
    state: &AppState,
    enrollment_id: &str,
    topic: &str,
    request: Request,
) -> Response {
    let (certificate, body) = match read_request(state, request).await {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    if let Err(e) = state.certauth.check(enrollment_id, &certificate).await {
        return rejection(enrollment_id, &e);
    }

    state
        .events
        .emit(Event::checkin(topic, enrollment_id, body.to_vec()));
    StatusCode::OK.into_response()
}

/// Command result reported on the connect endpoint.
#[derive(Debug, Deserialize)]
struct CommandReport {
    status: String,
    #[serde(default)]
    command_uuid: String,
}

/// PUT /connect/{enrollment_id}: command results; an empty body means idle.
async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<String>,
    request: Request,
) -> Response {
    let (certificate, body) = match read_request(&state, request).await {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    let report = if body.is_empty() {
        CommandReport {
            status: "Idle".to_string(),
            command_uuid: String::new(),
        }
    } else {
        match serde_json::from_slice::<CommandReport>(&body) {
            Ok(report) => report,
            Err(e) => {
                info!(%enrollment_id, error = %e, "Malformed command report");
                return bad_request();
            }
        }
    };

    if let Err(e) = state.certauth.check(&enrollment_id, &certificate).await {
        return rejection(&enrollment_id, &e);
    }

    state.events.emit(Event::connect(
        &enrollment_id,
        report.status,
        report.command_uuid,
        body.to_vec(),
    ));
    StatusCode::OK.into_response()
}

/// The verified certificate and the body. A missing certificate (only
/// possible with the `allow_all` verifier) is a client error here.
async fn read_request(
    state: &AppState,
    request: Request,
) -> Result<(IdentityCertificate, Bytes), Response> {
    let Some(VerifiedCertificate(certificate)) =
        request.extensions().get::<VerifiedCertificate>().cloned()
    else {
        info!("Protocol request without identity certificate");
        return Err(bad_request());
    };

    let body = axum::body::to_bytes(request.into_body(), state.max_body_size)
        .await
        .map_err(|e| {
            info!(error = %e, "Could not read request body");
            bad_request()
        })?;

    Ok((certificate, body))
}

fn rejection(enrollment_id: &str, error: &CertAuthError) -> Response {
    match error {
        CertAuthError::Storage(e) => {
            warn!(%enrollment_id, error = %e, "Association store failure");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        e => {
            info!(%enrollment_id, error = %e, "Certificate association rejected");
            bad_request()
        }
    }
}
