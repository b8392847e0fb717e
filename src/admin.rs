//! Operator REST endpoints: test conversations, lead booking, stats and
//! queue tooling.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use crate::conversation::{ConversationKey, Platform};
use crate::error::DatabaseError;
use crate::queue::{ConversationTarget, Job, JobQueue, ProcessMessageJob, Sender};
use crate::store::Database;

/// External user id of every test conversation.
pub const TEST_USER_ID: &str = "test_user";

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AdminState {
    pub db: Arc<dyn Database>,
    pub queue: Arc<JobQueue>,
}

pub fn admin_routes(db: Arc<dyn Database>, queue: Arc<JobQueue>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/test/messages", post(send_test_message))
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/close", post(close_conversation))
        .route("/api/leads/{conversation_id}/booking", post(book_lead))
        .route("/api/agents/{id}/stats", get(agent_stats))
        .route("/api/agents/{id}/jobs", delete(cancel_agent_jobs))
        .route("/api/dispatch-failures", get(list_dispatch_failures))
        .route("/api/jobs/dead-letter", get(list_dead_letters))
        .route("/api/jobs/{id}/requeue", post(requeue_job))
        .with_state(AdminState { db, queue })
}

type ApiResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({"error": message.into()})))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw).map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

fn internal(e: DatabaseError) -> ApiResponse {
    error!(error = %e, "Admin request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500)
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "setter-ai"
    }))
}

// ── Test conversations ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestMessageRequest {
    agent_config_id: Uuid,
    message: String,
}

async fn send_test_message(
    State(state): State<AdminState>,
    Json(body): Json<TestMessageRequest>,
) -> Result<ApiResponse, ApiResponse> {
    if body.message.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Message is empty"));
    }
    if state
        .db
        .get_agent_config(body.agent_config_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(error_response(StatusCode::NOT_FOUND, "Agent config not found"));
    }

    let key = ConversationKey::new(body.agent_config_id, Platform::Test, TEST_USER_ID);
    let partition = key.partition_key();
    let job = Job::ProcessMessage(ProcessMessageJob {
        target: ConversationTarget::Key {
            conversation_key: key,
        },
        text: body.message,
        sender: Sender {
            id: TEST_USER_ID.to_string(),
            name: None,
        },
        attachments: Vec::new(),
        timestamp: chrono::Utc::now(),
        is_postback: false,
        postback_payload: None,
        message_id: None,
        account_id: None,
    });
    let job_id = state
        .queue
        .enqueue(job, partition, Some(body.agent_config_id))
        .await
        .map_err(internal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "queued", "jobId": job_id})),
    ))
}

// ── Conversations ───────────────────────────────────────────────────────

async fn get_conversation(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id, "conversation")?;
    let conversation = state
        .db
        .get_conversation(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Conversation not found"))?;
    let lead = state.db.get_lead(id).await.map_err(internal)?;

    Ok((
        StatusCode::OK,
        Json(json!({"conversation": conversation, "lead": lead})),
    ))
}

async fn close_conversation(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id, "conversation")?;
    match state.db.close_conversation(id).await {
        Ok(true) => Ok((StatusCode::OK, Json(json!({"status": "closed"})))),
        Ok(false) => Err(error_response(StatusCode::CONFLICT, "Conversation already closed")),
        Err(DatabaseError::NotFound { .. }) => {
            Err(error_response(StatusCode::NOT_FOUND, "Conversation not found"))
        }
        Err(e) => Err(internal(e)),
    }
}

// ── Leads ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingRequest {
    meeting_link: String,
}

async fn book_lead(
    State(state): State<AdminState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<BookingRequest>,
) -> Result<ApiResponse, ApiResponse> {
    let conversation_id = parse_id(&conversation_id, "conversation")?;
    match state
        .db
        .mark_lead_booked(conversation_id, body.meeting_link.trim())
        .await
    {
        Ok(lead) => {
            info!(%conversation_id, "Meeting booked");
            Ok((StatusCode::OK, Json(json!(lead))))
        }
        Err(DatabaseError::NotFound { .. }) => {
            Err(error_response(StatusCode::NOT_FOUND, "Lead not found"))
        }
        Err(e) => Err(internal(e)),
    }
}

async fn agent_stats(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id, "agent")?;
    let stats = state.db.agent_stats(id).await.map_err(internal)?;
    Ok((StatusCode::OK, Json(json!(stats))))
}

async fn list_dispatch_failures(
    State(state): State<AdminState>,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse, ApiResponse> {
    let failures = state
        .db
        .list_dispatch_failures(query.limit())
        .await
        .map_err(internal)?;
    Ok((StatusCode::OK, Json(json!(failures))))
}

// ── Queue tooling ───────────────────────────────────────────────────────

async fn list_dead_letters(
    State(state): State<AdminState>,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse, ApiResponse> {
    let jobs = state.queue.dead_letters(query.limit()).await.map_err(internal)?;
    Ok((StatusCode::OK, Json(json!(jobs))))
}

async fn requeue_job(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id, "job")?;
    if state.queue.requeue(id).await.map_err(internal)? {
        Ok((StatusCode::OK, Json(json!({"status": "requeued"}))))
    } else {
        Err(error_response(
            StatusCode::NOT_FOUND,
            "Job not found or not dead-lettered",
        ))
    }
}

async fn cancel_agent_jobs(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id, "agent")?;
    let cancelled = state.queue.cancel_for_agent(id).await.map_err(internal)?;
    Ok((StatusCode::OK, Json(json!({"cancelled": cancelled}))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::agent_config::AgentConfig;
    use crate::conversation::{Role, Turn};
    use crate::error::JobError;
    use crate::qualification::{LeadFields, LeadUpsert};
    use crate::queue::{JobStatus, QualifyLeadJob, RetryPolicy};
    use crate::store::LibSqlBackend;

    struct TestApp {
        db: Arc<dyn Database>,
        queue: Arc<JobQueue>,
        router: Router,
    }

    async fn test_app() -> TestApp {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = JobQueue::new(
            Arc::clone(&db),
            RetryPolicy {
                max_attempts: 1,
                ..Default::default()
            },
            Duration::from_secs(60),
        );
        let router = admin_routes(Arc::clone(&db), Arc::clone(&queue));
        TestApp { db, queue, router }
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_message_is_queued_for_test_platform() {
        let app = test_app().await;
        let agent = AgentConfig::new("Setter", "prompt");
        app.db.upsert_agent_config(&agent).await.unwrap();

        let (status, body) = call(
            &app.router,
            post_json(
                "/api/test/messages",
                json!({"agentConfigId": agent.id, "message": "Hello"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let job_id: Uuid = body["jobId"].as_str().unwrap().parse().unwrap();
        let record = app.queue.get(job_id).await.unwrap().unwrap();
        let Job::ProcessMessage(job) = record.job else {
            panic!("expected process-message");
        };
        match job.target {
            ConversationTarget::Key { conversation_key } => {
                assert_eq!(conversation_key.platform, Platform::Test);
                assert_eq!(conversation_key.external_user_id, TEST_USER_ID);
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_for_unknown_agent_is_404() {
        let app = test_app().await;
        let (status, _) = call(
            &app.router,
            post_json(
                "/api/test/messages",
                json!({"agentConfigId": Uuid::new_v4(), "message": "Hello"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn conversation_lookup_close_and_booking() {
        let app = test_app().await;
        let agent = AgentConfig::new("Setter", "prompt");
        app.db.upsert_agent_config(&agent).await.unwrap();
        let conversation = app
            .db
            .create_conversation(
                &ConversationKey::new(agent.id, Platform::Test, TEST_USER_ID),
                json!({}),
            )
            .await
            .unwrap();
        app.db
            .append_turns_and_activate(
                conversation.id,
                &[Turn {
                    role: Role::User,
                    content: "Hi".into(),
                    timestamp: chrono::Utc::now(),
                    message_id: None,
                }],
                0,
            )
            .await
            .unwrap();

        let uri = format!("/api/conversations/{}", conversation.id);
        let (status, body) = call(&app.router, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conversation"]["messages"][0]["content"], "Hi");
        assert!(body["lead"].is_null());

        let booking = format!("/api/leads/{}/booking", conversation.id);
        let (status, _) = call(
            &app.router,
            post_json(&booking, json!({"meetingLink": "https://cal.example/abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.db
            .upsert_lead(
                conversation.id,
                &LeadUpsert {
                    contact_info: LeadFields::default(),
                    qualification_score: 8,
                    qualification_reason: "fit".into(),
                    next_action: "contact".into(),
                },
            )
            .await
            .unwrap();
        let (status, body) = call(
            &app.router,
            post_json(&booking, json!({"meetingLink": "https://cal.example/abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nextAction"], "booked");
        assert_eq!(body["meetingLink"], "https://cal.example/abc");

        let close = format!("/api/conversations/{}/close", conversation.id);
        let (status, _) = call(&app.router, Request::post(&close).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app.router, Request::post(&close).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let stats = format!("/api/agents/{}/stats", agent.id);
        let (status, body) = call(&app.router, Request::get(&stats).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalConversations"], 1);
        assert_eq!(body["bookedMeetings"], 1);
    }

    #[tokio::test]
    async fn dead_letter_listing_and_requeue() {
        let app = test_app().await;
        let id = app
            .queue
            .enqueue(
                Job::QualifyLead(QualifyLeadJob {
                    conversation_id: Uuid::new_v4(),
                }),
                "p".into(),
                None,
            )
            .await
            .unwrap();
        let record = app.queue.claim("w").await.unwrap().unwrap();
        app.queue
            .fail(&record, "w", &JobError::ConversationNotFound { id: Uuid::new_v4() })
            .await
            .unwrap();

        let (status, body) = call(
            &app.router,
            Request::get("/api/jobs/dead-letter").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/api/jobs/{id}/requeue");
        let (status, _) = call(&app.router, Request::post(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.queue.get(id).await.unwrap().unwrap().status, JobStatus::Pending);

        let (status, _) = call(&app.router, Request::post(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_agent_jobs_counts_queued() {
        let app = test_app().await;
        let agent_id = Uuid::new_v4();
        for _ in 0..2 {
            app.queue
                .enqueue(
                    Job::QualifyLead(QualifyLeadJob {
                        conversation_id: Uuid::new_v4(),
                    }),
                    "p".into(),
                    Some(agent_id),
                )
                .await
                .unwrap();
        }
        let uri = format!("/api/agents/{agent_id}/jobs");
        let (status, body) = call(&app.router, Request::delete(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 2);
    }

    #[tokio::test]
    async fn invalid_ids_are_400() {
        let app = test_app().await;
        let (status, _) = call(
            &app.router,
            Request::get("/api/conversations/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
