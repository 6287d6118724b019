use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{HeaderMap, Uri, header},
    response::Json,
    routing::get,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use url::form_urlencoded;

use crate::config::Config;
use crate::error::AppError;
use crate::services::{DispatchService, Payload};

/// Request bodies above this size are rejected with 413.
const MAX_BODY_BYTES: usize = 1_048_576;

#[derive(Clone)]
pub struct AppState {
    pub dispatch: DispatchService,
    /// Deliveries run here so a caller hanging up cannot cut them short.
    pub tracker: TaskTracker,
    /// Storage failures are escalated to the server task through this.
    pub fatal: mpsc::Sender<String>,
}

pub fn create_router(app_state: AppState, config: &Config) -> Router {
    let mount = config.mount_path();
    let health_path = if mount.is_empty() { "/" } else { mount };

    Router::new()
        .route(health_path, get(health_check))
        .route(
            &format!("{mount}/{{token}}"),
            get(webhook_handler).post(webhook_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // The URI holds the token and query payload, so spans only get the method.
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                info_span!("callback", method = %request.method())
            }),
        ))
        .with_state(app_state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn webhook_handler(
    State(state): State<AppState>,
    Path(token): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let result = handle_callback(&state, &token, uri.query(), &headers, &body).await;

    if let Err(e) = &result {
        if e.is_fatal() {
            // Capacity 1: one escalation is enough to stop the server.
            let _ = state.fatal.try_send(e.to_string());
        }
    }

    result.map(|()| Json(serde_json::json!({ "status": "delivered" })))
}

async fn handle_callback(
    state: &AppState,
    token: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let hook = state.dispatch.resolve(token).await?;
    let payload = extract_payload(query, headers, body)?;

    let dispatch = state.dispatch.clone();
    let delivery = state
        .tracker
        .spawn(async move { dispatch.deliver(&hook, payload).await });

    match delivery.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Delivery task failed: {e}");
            Err(AppError::Internal)
        }
    }
}

/// Collects payload fields from the query string and the body. Body fields
/// win over query fields of the same name; within each source the first
/// occurrence of a name wins.
pub fn extract_payload(
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Payload, AppError> {
    let mut payload = query
        .map(|q| form_fields(q.as_bytes()))
        .unwrap_or_default();

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(payload);
    }

    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let fields = if is_form {
        form_fields(body)
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => fields,
            _ => return Err(AppError::InvalidPayload),
        }
    };
    payload.extend(fields);
    Ok(payload)
}

fn form_fields(input: &[u8]) -> Payload {
    let mut fields = Payload::new();
    for (key, value) in form_urlencoded::parse(input) {
        fields
            .entry(key.into_owned())
            .or_insert_with(|| Value::String(value.into_owned()));
    }
    fields
}

/// Serves callbacks until `cancel` fires, then drains in-flight deliveries.
/// Returns an error if a request hit a storage failure.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    tracker: TaskTracker,
    mut fatal: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let shutdown = cancel.clone();
    let server = async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    };

    let outcome = tokio::select! {
        result = server => result.map_err(anyhow::Error::from),
        Some(reason) = fatal.recv() => {
            Err(anyhow::anyhow!("storage failure while serving callbacks: {reason}"))
        }
    };

    tracker.close();
    tracker.wait().await;
    info!("HTTP listener stopped");
    outcome
}
