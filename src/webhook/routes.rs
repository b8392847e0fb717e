//! HTTP surface of the webhook gateway.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use tracing::{error, info, warn};

use super::{SIGNATURE_HEADER, WebhookGateway};

/// `GET` (handshake) and `POST` (events) on `/webhooks/meta`.
pub fn webhook_routes(gateway: Arc<WebhookGateway>) -> Router {
    Router::new()
        .route("/webhooks/meta", get(verify).post(receive))
        .with_state(gateway)
}

/// Query value under Meta's `hub.`-prefixed name or the plain one.
fn param<'a>(query: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    query
        .get(&format!("hub.{name}"))
        .or_else(|| query.get(name))
        .map(String::as_str)
}

async fn verify(
    State(gateway): State<Arc<WebhookGateway>>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match gateway.verify_handshake(
        param(&query, "mode"),
        param(&query, "verify_token"),
        param(&query, "challenge"),
    ) {
        Ok(challenge) => (StatusCode::OK, challenge),
        Err(_) => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
    }
}

async fn receive(
    State(gateway): State<Arc<WebhookGateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = gateway.check_signature(signature, &body) {
        warn!(error = %e, "Rejected webhook event");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"status": "error", "message": "invalid signature"})),
        );
    }

    match gateway.handle_event(&body).await {
        Ok(accepted) => {
            info!(accepted, "Webhook event processed");
            (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
        }
        Err(e) => {
            error!(error = %e, "Webhook event failed");
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "error", "message": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use crate::queue::{JobQueue, RetryPolicy};
    use crate::store::{Database, LibSqlBackend};
    use crate::webhook::sign;

    async fn app(app_secret: Option<&str>) -> Router {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = JobQueue::new(Arc::clone(&db), RetryPolicy::default(), Duration::from_secs(60));
        webhook_routes(Arc::new(WebhookGateway::new(
            db,
            queue,
            SecretString::from("verify-me"),
            app_secret.map(SecretString::from),
        )))
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn handshake_with_hub_prefix() {
        let response = app(None)
            .await
            .oneshot(
                Request::get(
                    "/webhooks/meta?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=CHALLENGE_ACCEPTED",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "CHALLENGE_ACCEPTED");
    }

    #[tokio::test]
    async fn handshake_with_plain_names_and_wrong_token() {
        let response = app(None)
            .await
            .oneshot(
                Request::get("/webhooks/meta?mode=subscribe&verify_token=nope&challenge=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_event_still_acknowledged() {
        let response = app(None)
            .await
            .oneshot(
                Request::post("/webhooks/meta")
                    .header("content-type", "application/json")
                    .body(Body::from("{broken"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn signature_enforced_when_secret_set() {
        let payload = r#"{"object":"page","entry":[]}"#;

        let unsigned = app(Some("s3cret"))
            .await
            .oneshot(
                Request::post("/webhooks/meta")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unsigned.status(), StatusCode::FORBIDDEN);

        let header = sign(&SecretString::from("s3cret"), payload.as_bytes()).unwrap();
        let signed = app(Some("s3cret"))
            .await
            .oneshot(
                Request::post("/webhooks/meta")
                    .header(SIGNATURE_HEADER, header)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(signed).await).unwrap();
        assert_eq!(body["status"], "ok");
    }
}
