//! HTTP ingress: validates posted envelopes and queues them for the transport.

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{envelope::Envelope, queue::OutboundQueue};

/// Response body for every post, accepted or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation: String,
    pub successful: bool,
}

impl OperationResult {
    fn post(successful: bool) -> Self {
        Self {
            operation: "POST".to_string(),
            successful,
        }
    }
}

pub fn router(queue: OutboundQueue) -> Router {
    Router::new()
        .route("/", post(post_interface))
        .route("/post_interface", post(post_interface))
        .with_state(queue)
        .layer(TraceLayer::new_for_http())
}

/// Rejections are reported in the body with a 200; only a queue that is
/// already shutting down answers with an error status.
async fn post_interface(
    State(queue): State<OutboundQueue>,
    body: String,
) -> (StatusCode, Json<OperationResult>) {
    if let Some(reason) = rejection(&body) {
        info!(%reason, "rejecting posted message");
        return (StatusCode::OK, Json(OperationResult::post(false)));
    }

    info!(payload = %body, "broadcasting message");
    match queue.push(body) {
        Ok(()) => (StatusCode::OK, Json(OperationResult::post(true))),
        Err(err) => {
            warn!(error = %err, "cannot accept message");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(OperationResult::post(false)),
            )
        }
    }
}

fn rejection(body: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => return Some(format!("body is not JSON: {err}")),
    };
    let Some(object) = value.as_object() else {
        return Some("body is not a JSON object".to_string());
    };
    Envelope::missing_field(object).map(|field| format!("missing field `{field}`"))
}
