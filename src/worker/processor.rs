//! The conversation worker: turns queued jobs into replies and leads.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent_config::AgentConfig;
use crate::conversation::{Conversation, ConversationKey, Role};
use crate::dispatch::{DispatchFailure, ReplyDispatcher};
use crate::error::{JobError, LlmError};
use crate::llm::GenerationBackend;
use crate::qualification::{evaluate, should_qualify};
use crate::queue::{
    ConversationTarget, Job, JobOutcome, JobQueue, JobRecord, ProcessMessageJob, QualifyLeadJob,
    SkipReason,
};
use crate::store::Database;

/// When qualification runs, in USER turns.
#[derive(Debug, Clone, Copy)]
pub struct QualificationSchedule {
    pub threshold: usize,
    pub every: usize,
}

impl Default for QualificationSchedule {
    fn default() -> Self {
        Self {
            threshold: 3,
            every: 1,
        }
    }
}

/// Owns the conversation state machine. Stateless between jobs.
pub struct ConversationWorker {
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
    generation: GenerationBackend,
    dispatcher: Arc<dyn ReplyDispatcher>,
    schedule: QualificationSchedule,
}

/// Where a process-message job resolved to.
enum Resolved {
    Ready(AgentConfig, Conversation),
    Skip(SkipReason),
}

impl ConversationWorker {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<JobQueue>,
        generation: GenerationBackend,
        dispatcher: Arc<dyn ReplyDispatcher>,
        schedule: QualificationSchedule,
    ) -> Self {
        Self {
            db,
            queue,
            generation,
            dispatcher,
            schedule,
        }
    }

    /// Run one claimed job.
    pub async fn handle(&self, record: &JobRecord) -> Result<JobOutcome, JobError> {
        match &record.job {
            Job::ProcessMessage(job) => self.process_message(job).await,
            Job::QualifyLead(job) => self.qualify_lead(job).await,
        }
    }

    /// Answer one inbound message.
    ///
    /// Nothing is persisted unless generation succeeds; the user turn and the
    /// reply land together in one compare-and-append.
    pub async fn process_message(&self, job: &ProcessMessageJob) -> Result<JobOutcome, JobError> {
        let (agent, conversation) = match self.resolve(job).await? {
            Resolved::Ready(agent, conversation) => (agent, conversation),
            Resolved::Skip(reason) => return Ok(JobOutcome::Skipped(reason)),
        };

        if let Some(message_id) = job.message_id.as_deref() {
            if conversation.messages.contains_message(message_id) {
                debug!(conversation_id = %conversation.id, message_id, "Message already answered");
                return Ok(JobOutcome::Skipped(SkipReason::DuplicateMessage));
            }
        }

        let client = match self.generation.client() {
            Ok(client) => client,
            Err(_) => return Ok(JobOutcome::Skipped(SkipReason::GenerationUnconfigured)),
        };

        let mut append = conversation.messages.begin_append();
        append.push(Role::User, job.text.clone(), job.message_id.clone());

        let reply = client
            .generate_reply(&agent.system_prompt, append.prior_turns(), &job.text)
            .await?;

        append.push(Role::Assistant, reply.clone(), None);
        let expected_prior_len = append.base_len();
        let user_turns = append.user_turn_count();
        let new_turns = append.into_staged();

        let updated = self
            .db
            .append_turns_and_activate(conversation.id, &new_turns, expected_prior_len)
            .await?;
        info!(
            conversation_id = %updated.id,
            agent_config_id = %agent.id,
            turns = updated.messages.len(),
            status = %updated.status,
            "Reply persisted"
        );

        self.dispatch(&agent, &updated, &job.sender.id, &reply).await;

        if should_qualify(user_turns, self.schedule.threshold, self.schedule.every) {
            let qualify = Job::QualifyLead(QualifyLeadJob {
                conversation_id: updated.id,
            });
            // The reply is already out, so a failure here must not retry the job.
            match self
                .queue
                .enqueue(qualify, updated.key().partition_key(), Some(agent.id))
                .await
            {
                Ok(job_id) => {
                    debug!(conversation_id = %updated.id, %job_id, user_turns, "Qualification queued")
                }
                Err(e) => error!(
                    conversation_id = %updated.id,
                    error = %e,
                    "Failed to queue qualification"
                ),
            }
        }

        Ok(JobOutcome::Completed)
    }

    /// Score a conversation and upsert its lead when it qualifies.
    pub async fn qualify_lead(&self, job: &QualifyLeadJob) -> Result<JobOutcome, JobError> {
        let conversation = self
            .db
            .get_conversation(job.conversation_id)
            .await?
            .ok_or(JobError::ConversationNotFound {
                id: job.conversation_id,
            })?;

        let agent = match self.active_agent(conversation.agent_config_id).await? {
            Ok(agent) => agent,
            Err(reason) => return Ok(JobOutcome::Skipped(reason)),
        };
        let client = match self.generation.client() {
            Ok(client) => client,
            Err(_) => return Ok(JobOutcome::Skipped(SkipReason::GenerationUnconfigured)),
        };

        let criteria = &agent.qualification_criteria;
        let scored = client
            .score_qualification(conversation.messages.turns(), criteria)
            .await
            .and_then(|report| evaluate(report, criteria, client.provider_name()));

        let result = match scored {
            Ok(result) => result,
            Err(LlmError::Malformed { reason, .. }) => {
                warn!(
                    conversation_id = %conversation.id,
                    reason = %reason,
                    "Unusable qualification response, lead left unchanged"
                );
                return Ok(JobOutcome::Completed);
            }
            Err(e) => return Err(e.into()),
        };

        match result.lead_fields() {
            Some(fields) => {
                let lead = self.db.upsert_lead(conversation.id, &fields).await?;
                info!(
                    conversation_id = %conversation.id,
                    lead_id = %lead.id,
                    score = result.score,
                    min_score = result.min_score,
                    "Lead qualified"
                );
            }
            None => info!(
                conversation_id = %conversation.id,
                score = result.score,
                min_score = result.min_score,
                "Lead not qualified"
            ),
        }
        Ok(JobOutcome::Completed)
    }

    async fn resolve(&self, job: &ProcessMessageJob) -> Result<Resolved, JobError> {
        match &job.target {
            ConversationTarget::Key { conversation_key } => {
                let agent = match self.active_agent(conversation_key.agent_config_id).await? {
                    Ok(agent) => agent,
                    Err(reason) => return Ok(Resolved::Skip(reason)),
                };
                let conversation = self.find_or_create(conversation_key, job).await?;
                Ok(Resolved::Ready(agent, conversation))
            }
            ConversationTarget::Id { conversation_id } => {
                let conversation = self
                    .db
                    .get_conversation(*conversation_id)
                    .await?
                    .ok_or(JobError::ConversationNotFound {
                        id: *conversation_id,
                    })?;
                if !conversation.status.is_open() {
                    return Ok(Resolved::Skip(SkipReason::ConversationClosed));
                }
                let agent = match self.active_agent(conversation.agent_config_id).await? {
                    Ok(agent) => agent,
                    Err(reason) => return Ok(Resolved::Skip(reason)),
                };
                Ok(Resolved::Ready(agent, conversation))
            }
        }
    }

    async fn active_agent(
        &self,
        agent_config_id: Uuid,
    ) -> Result<Result<AgentConfig, SkipReason>, JobError> {
        Ok(match self.db.get_agent_config(agent_config_id).await? {
            None => {
                warn!(%agent_config_id, "Agent config not found");
                Err(SkipReason::AgentNotFound)
            }
            Some(agent) if !agent.is_active => Err(SkipReason::AgentInactive),
            Some(agent) => Ok(agent),
        })
    }

    async fn find_or_create(
        &self,
        key: &ConversationKey,
        job: &ProcessMessageJob,
    ) -> Result<Conversation, JobError> {
        if let Some(conversation) = self.db.find_open_conversation(key).await? {
            return Ok(conversation);
        }
        let metadata = serde_json::json!({
            "accountId": job.account_id,
            "startedAt": Utc::now(),
        });
        let conversation = self.db.create_conversation(key, metadata).await?;
        info!(
            conversation_id = %conversation.id,
            platform = %key.platform,
            external_user_id = %key.external_user_id,
            "Conversation started"
        );
        Ok(conversation)
    }

    /// Send the reply. Failures are recorded for operators, never retried.
    async fn dispatch(
        &self,
        agent: &AgentConfig,
        conversation: &Conversation,
        recipient_id: &str,
        reply: &str,
    ) {
        let sent = self
            .dispatcher
            .send(
                conversation.platform,
                recipient_id,
                reply,
                agent.access_token.as_ref(),
            )
            .await;
        let Err(e) = sent else {
            return;
        };

        error!(
            conversation_id = %conversation.id,
            platform = %conversation.platform,
            recipient_id,
            error = %e,
            "Reply dispatch failed"
        );
        let failure = DispatchFailure {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            agent_config_id: agent.id,
            platform: conversation.platform,
            recipient_id: recipient_id.to_string(),
            reply_text: reply.to_string(),
            error: e.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.record_dispatch_failure(&failure).await {
            error!(conversation_id = %conversation.id, error = %e, "Failed to record dispatch failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::conversation::{ConversationStatus, Platform};
    use crate::error::DispatchError;
    use crate::llm::{
        CompletionRequest, CompletionResponse, FinishReason, GenerationClient,
        GenerationSettings, LlmProvider,
    };
    use crate::queue::{JobStatus, RetryPolicy, Sender};
    use crate::store::LibSqlBackend;

    /// Replies with canned text, or scores with canned JSON when asked to evaluate.
    struct ScriptedLlm {
        score_json: String,
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let scoring = request
                .messages
                .iter()
                .any(|m| m.content.contains("single JSON object"));
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResponse {
                content: if scoring {
                    self.score_json.clone()
                } else {
                    format!("Echo: {last}")
                },
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<(Platform, String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ReplyDispatcher for RecordingDispatcher {
        async fn send(
            &self,
            platform: Platform,
            recipient_id: &str,
            text: &str,
            _access_token: Option<&SecretString>,
        ) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Failed {
                    platform: platform.to_string(),
                    status: 500,
                    reason: "boom".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((platform, recipient_id.into(), text.into()));
            Ok(())
        }
    }

    struct Harness {
        db: Arc<dyn Database>,
        queue: Arc<JobQueue>,
        dispatcher: Arc<RecordingDispatcher>,
        worker: ConversationWorker,
        agent: AgentConfig,
    }

    async fn harness(score_json: &str, dispatcher: RecordingDispatcher) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = JobQueue::new(Arc::clone(&db), RetryPolicy::default(), Duration::from_secs(60));
        let agent = AgentConfig::new("Setter", "You qualify leads.")
            .with_criteria("Budget above 1000", 7)
            .with_access_token("page-token");
        db.upsert_agent_config(&agent).await.unwrap();

        let client = GenerationClient::new(
            Arc::new(ScriptedLlm {
                score_json: score_json.into(),
            }),
            GenerationSettings::default(),
        );
        let dispatcher = Arc::new(dispatcher);
        let worker = ConversationWorker::new(
            Arc::clone(&db),
            Arc::clone(&queue),
            GenerationBackend::Configured(client),
            dispatcher.clone(),
            QualificationSchedule::default(),
        );
        Harness {
            db,
            queue,
            dispatcher,
            worker,
            agent,
        }
    }

    fn message(agent_id: Uuid, text: &str, message_id: Option<&str>) -> ProcessMessageJob {
        ProcessMessageJob {
            target: ConversationTarget::Key {
                conversation_key: ConversationKey::new(agent_id, Platform::Messenger, "psid-1"),
            },
            text: text.into(),
            sender: Sender {
                id: "psid-1".into(),
                name: None,
            },
            attachments: vec![],
            timestamp: Utc::now(),
            is_postback: false,
            postback_payload: None,
            message_id: message_id.map(str::to_string),
            account_id: Some("page-1".into()),
        }
    }

    const QUALIFIED: &str = r#"{"isQualified": true, "score": 8, "extractedInfo": {"name": "Marie"}, "reasoning": "clear budget", "nextSteps": "call"}"#;

    #[tokio::test]
    async fn first_message_creates_and_activates_conversation() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        let outcome = h
            .worker
            .process_message(&message(h.agent.id, "Hi there", Some("mid.1")))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let key = ConversationKey::new(h.agent.id, Platform::Messenger, "psid-1");
        let conversation = h.db.find_open_conversation(&key).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Active);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages.turns()[1].content, "Echo: Hi there");
        assert_eq!(conversation.metadata["accountId"], "page-1");

        let sent = h.dispatcher.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(Platform::Messenger, "psid-1".into(), "Echo: Hi there".into())]);
    }

    #[tokio::test]
    async fn redelivered_message_is_skipped() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        let job = message(h.agent.id, "Hi", Some("mid.1"));
        h.worker.process_message(&job).await.unwrap();
        let again = h.worker.process_message(&job).await.unwrap();
        assert_eq!(again, JobOutcome::Skipped(SkipReason::DuplicateMessage));
        assert_eq!(h.dispatcher.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inactive_agent_is_skipped_without_side_effects() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        let inactive = AgentConfig::new("Paused", "p").inactive();
        h.db.upsert_agent_config(&inactive).await.unwrap();

        let outcome = h
            .worker
            .process_message(&message(inactive.id, "Hi", None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::AgentInactive));

        let key = ConversationKey::new(inactive.id, Platform::Messenger, "psid-1");
        assert!(h.db.find_open_conversation(&key).await.unwrap().is_none());
        assert!(h.dispatcher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_is_skipped() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        let outcome = h
            .worker
            .process_message(&message(Uuid::new_v4(), "Hi", None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::AgentNotFound));
    }

    #[tokio::test]
    async fn unconfigured_generation_is_skipped() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        let worker = ConversationWorker::new(
            Arc::clone(&h.db),
            Arc::clone(&h.queue),
            GenerationBackend::Unconfigured,
            h.dispatcher.clone(),
            QualificationSchedule::default(),
        );
        let outcome = worker
            .process_message(&message(h.agent.id, "Hi", None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::GenerationUnconfigured));
    }

    #[tokio::test]
    async fn closed_conversation_by_id_is_skipped() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        h.worker
            .process_message(&message(h.agent.id, "Hi", None))
            .await
            .unwrap();
        let key = ConversationKey::new(h.agent.id, Platform::Messenger, "psid-1");
        let conversation = h.db.find_open_conversation(&key).await.unwrap().unwrap();
        h.db.close_conversation(conversation.id).await.unwrap();

        let mut job = message(h.agent.id, "Still there?", None);
        job.target = ConversationTarget::Id {
            conversation_id: conversation.id,
        };
        let outcome = h.worker.process_message(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::ConversationClosed));
    }

    #[tokio::test]
    async fn dispatch_failure_is_recorded_and_job_completes() {
        let h = harness(
            QUALIFIED,
            RecordingDispatcher {
                fail: true,
                ..Default::default()
            },
        )
        .await;
        let outcome = h
            .worker
            .process_message(&message(h.agent.id, "Hi", None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let failures = h.db.list_dispatch_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reply_text, "Echo: Hi");
        assert_eq!(failures[0].recipient_id, "psid-1");
    }

    #[tokio::test]
    async fn third_user_turn_queues_qualification() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        for text in ["one", "two"] {
            h.worker
                .process_message(&message(h.agent.id, text, None))
                .await
                .unwrap();
        }
        assert!(h.queue.claim("t").await.unwrap().is_none());

        h.worker
            .process_message(&message(h.agent.id, "three", None))
            .await
            .unwrap();
        let record = h.queue.claim("t").await.unwrap().unwrap();
        assert!(matches!(record.job, Job::QualifyLead(_)));
        assert_eq!(record.agent_config_id, Some(h.agent.id));
        assert_eq!(
            record.partition_key,
            ConversationKey::new(h.agent.id, Platform::Messenger, "psid-1").partition_key()
        );

        assert_eq!(h.worker.handle(&record).await.unwrap(), JobOutcome::Completed);
        h.queue.complete(&record, "t", &JobOutcome::Completed).await.unwrap();
        let Job::QualifyLead(job) = &record.job else { unreachable!() };
        let lead = h.db.get_lead(job.conversation_id).await.unwrap().unwrap();
        assert_eq!(lead.qualification_score, 8);
        assert_eq!(lead.next_action, "call");
        assert_eq!(
            h.queue.get(record.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn below_threshold_score_creates_no_lead() {
        let h = harness(
            r#"{"isQualified": false, "score": 4, "extractedInfo": {}, "reasoning": "no budget"}"#,
            RecordingDispatcher::default(),
        )
        .await;
        h.worker
            .process_message(&message(h.agent.id, "Hi", None))
            .await
            .unwrap();
        let key = ConversationKey::new(h.agent.id, Platform::Messenger, "psid-1");
        let conversation = h.db.find_open_conversation(&key).await.unwrap().unwrap();

        let outcome = h
            .worker
            .qualify_lead(&QualifyLeadJob {
                conversation_id: conversation.id,
            })
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert!(h.db.get_lead(conversation.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn out_of_range_score_is_absorbed() {
        let h = harness(
            r#"{"score": 42, "extractedInfo": {}, "reasoning": "?"}"#,
            RecordingDispatcher::default(),
        )
        .await;
        h.worker
            .process_message(&message(h.agent.id, "Hi", None))
            .await
            .unwrap();
        let key = ConversationKey::new(h.agent.id, Platform::Messenger, "psid-1");
        let conversation = h.db.find_open_conversation(&key).await.unwrap().unwrap();

        let outcome = h
            .worker
            .qualify_lead(&QualifyLeadJob {
                conversation_id: conversation.id,
            })
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert!(h.db.get_lead(conversation.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn qualifying_missing_conversation_is_permanent_error() {
        let h = harness(QUALIFIED, RecordingDispatcher::default()).await;
        let err = h
            .worker
            .qualify_lead(&QualifyLeadJob {
                conversation_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ConversationNotFound { .. }));
        assert!(!err.is_retryable());
    }
}
