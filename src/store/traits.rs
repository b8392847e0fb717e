//! Unified `Database` trait: single async interface for all persistence.
//!
//! The store is the only shared mutable resource in the pipeline. Every
//! method is a short statement or a single atomic write; nothing holds a
//! transaction open across a network call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent_config::AgentConfig;
use crate::conversation::{Conversation, ConversationKey, Platform, Turn};
use crate::dispatch::DispatchFailure;
use crate::error::DatabaseError;
use crate::qualification::{AgentStats, ExtractedLead, LeadUpsert};
use crate::queue::{JobRecord, JobStatus, NewJob};

/// Backend-agnostic database trait covering configs, conversations, leads and jobs.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Agent configs ───────────────────────────────────────────────

    /// Resolve the agent serving a platform page/account.
    async fn find_config_by_platform_account(
        &self,
        platform: Platform,
        account_id: &str,
    ) -> Result<Option<AgentConfig>, DatabaseError>;

    async fn get_agent_config(&self, id: Uuid) -> Result<Option<AgentConfig>, DatabaseError>;

    /// Insert or replace an agent profile.
    async fn upsert_agent_config(&self, config: &AgentConfig) -> Result<(), DatabaseError>;

    /// Map a platform account to an agent. Replaces any existing mapping.
    async fn link_platform_account(
        &self,
        platform: Platform,
        account_id: &str,
        agent_config_id: Uuid,
    ) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// The PENDING or ACTIVE conversation for a triple, if any.
    async fn find_open_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Create a PENDING conversation with an empty log.
    ///
    /// If an open conversation for the triple already exists (a concurrent
    /// creator won), that conversation is returned instead.
    async fn create_conversation(
        &self,
        key: &ConversationKey,
        metadata: serde_json::Value,
    ) -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Compare-and-append.
    ///
    /// Appends `new_turns` iff the log still holds exactly
    /// `expected_prior_len` turns and the conversation is not closed. The
    /// write also moves a PENDING conversation to ACTIVE once an ASSISTANT
    /// turn lands. Fails with `ConcurrentModification` otherwise.
    async fn append_turns_and_activate(
        &self,
        conversation_id: Uuid,
        new_turns: &[Turn],
        expected_prior_len: usize,
    ) -> Result<Conversation, DatabaseError>;

    /// External closure. Returns false when the conversation was already closed.
    async fn close_conversation(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Create or update the lead of a conversation. Never duplicates.
    async fn upsert_lead(
        &self,
        conversation_id: Uuid,
        fields: &LeadUpsert,
    ) -> Result<ExtractedLead, DatabaseError>;

    async fn get_lead(&self, conversation_id: Uuid)
    -> Result<Option<ExtractedLead>, DatabaseError>;

    /// Record a booked meeting on an existing lead.
    async fn mark_lead_booked(
        &self,
        conversation_id: Uuid,
        meeting_link: &str,
    ) -> Result<ExtractedLead, DatabaseError>;

    async fn agent_stats(&self, agent_config_id: Uuid) -> Result<AgentStats, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &NewJob) -> Result<(), DatabaseError>;

    /// Atomically claim the next runnable job.
    ///
    /// A job is runnable when it is due (or its lease expired), no other job
    /// of its partition holds a live lease, and no earlier job of the
    /// partition is still queued.
    async fn claim_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, DatabaseError>;

    /// Finish a job held by `worker_id` with a terminal status.
    async fn finish_job(
        &self,
        id: Uuid,
        worker_id: &str,
        status: JobStatus,
        outcome: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Put a failed job back in the queue for a later attempt.
    async fn reschedule_job(
        &self,
        id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DatabaseError>;

    async fn dead_letter_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Cancel queued jobs of an agent that have not started. Returns the count.
    async fn cancel_pending_jobs(&self, agent_config_id: Uuid) -> Result<u64, DatabaseError>;

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget.
    /// Returns false when the job is not dead.
    async fn requeue_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    // ── Dispatch failures ───────────────────────────────────────────

    async fn record_dispatch_failure(&self, failure: &DispatchFailure)
    -> Result<(), DatabaseError>;

    async fn list_dispatch_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchFailure>, DatabaseError>;
}
