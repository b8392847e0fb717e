//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339 with millisecond precision and a `Z` suffix so that string
//! comparison in SQL matches chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent_config::{AgentConfig, QualificationCriteria};
use crate::conversation::{
    Conversation, ConversationKey, ConversationStatus, Platform, Turn, TurnLog,
};
use crate::dispatch::DispatchFailure;
use crate::error::DatabaseError;
use crate::qualification::model::BOOKED_NEXT_ACTION;
use crate::qualification::{AgentStats, ExtractedLead, LeadFields, LeadUpsert};
use crate::queue::{Job, JobRecord, JobStatus, NewJob};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_turns(&self, conversation_id: &str) -> Result<TurnLog, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role, content, created_at, message_id FROM conversation_turns \
                 WHERE conversation_id = ?1 ORDER BY seq",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_turns: {e}")))?;

        let mut turns = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_turns: {e}")))?
        {
            let role: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("load_turns row: {e}")))?;
            let content: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("load_turns row: {e}")))?;
            let created: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("load_turns row: {e}")))?;
            turns.push(Turn {
                role: role.parse().map_err(DatabaseError::Serialization)?,
                content,
                timestamp: parse_datetime(&created),
                message_id: row.get::<String>(3).ok(),
            });
        }
        Ok(TurnLog::from_persisted(turns))
    }

    async fn conversation_from_row(&self, row: &libsql::Row) -> Result<Conversation, DatabaseError> {
        let get = |i: i32| {
            row.get::<String>(i)
                .map_err(|e| DatabaseError::Query(format!("conversation row: {e}")))
        };
        let id = get(0)?;
        let agent_config_id = get(1)?;
        let platform = get(2)?;
        let external_user_id = get(3)?;
        let status = get(4)?;
        let metadata = get(5)?;
        let created_at = get(6)?;
        let updated_at = get(7)?;

        Ok(Conversation {
            id: parse_uuid(&id)?,
            agent_config_id: parse_uuid(&agent_config_id)?,
            platform: platform.parse().map_err(DatabaseError::Serialization)?,
            external_user_id,
            status: status.parse().map_err(DatabaseError::Serialization)?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| DatabaseError::Serialization(format!("conversation metadata: {e}")))?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
            messages: self.load_turns(&id).await?,
        })
    }

    async fn query_one_conversation(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(self.conversation_from_row(&row).await?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn query_jobs(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn query_one_lead(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<ExtractedLead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| map_write_error(op, e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(map_write_error(op, e)),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const CONVERSATION_COLUMNS: &str =
    "id, agent_config_id, platform, external_user_id, status, metadata, created_at, updated_at";

const JOB_COLUMNS: &str = "seq, id, kind, payload, partition_key, agent_config_id, status, \
     attempts, max_attempts, available_at, locked_by, locked_until, last_error, outcome, \
     created_at, updated_at";

const LEAD_COLUMNS: &str = "id, conversation_id, contact_info, qualification_score, \
     qualification_reason, next_action, booked_at, meeting_link, created_at, updated_at";

/// Canonical timestamp format for every stored time.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("invalid uuid {s}: {e}")))
}

fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

/// Constraint failures surface as errors with SQLite's message text.
fn map_write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn row_to_agent_config(row: &libsql::Row) -> Result<AgentConfig, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("agent_config row: {e}"));
    let id: String = row.get(0).map_err(parse_err)?;
    let criteria: String = row.get(3).map_err(parse_err)?;
    let is_active: i64 = row.get(4).map_err(parse_err)?;

    Ok(AgentConfig {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(parse_err)?,
        system_prompt: row.get(2).map_err(parse_err)?,
        qualification_criteria: serde_json::from_str::<QualificationCriteria>(&criteria)
            .map_err(|e| DatabaseError::Serialization(format!("qualification_criteria: {e}")))?,
        is_active: is_active != 0,
        access_token: row.get::<String>(5).ok().map(SecretString::from),
    })
}

fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));
    let id: String = row.get(1).map_err(parse_err)?;
    let payload: String = row.get(3).map_err(parse_err)?;
    let status: String = row.get(6).map_err(parse_err)?;
    let attempts: i64 = row.get(7).map_err(parse_err)?;
    let max_attempts: i64 = row.get(8).map_err(parse_err)?;
    let available_at: String = row.get(9).map_err(parse_err)?;
    let created_at: String = row.get(14).map_err(parse_err)?;
    let updated_at: String = row.get(15).map_err(parse_err)?;

    let job: Job = serde_json::from_str(&payload)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} payload: {e}")))?;

    Ok(JobRecord {
        id: parse_uuid(&id)?,
        seq: row.get(0).map_err(parse_err)?,
        job,
        partition_key: row.get(4).map_err(parse_err)?,
        agent_config_id: row
            .get::<String>(5)
            .ok()
            .map(|s| parse_uuid(&s))
            .transpose()?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
        available_at: parse_datetime(&available_at),
        locked_by: row.get::<String>(10).ok(),
        locked_until: parse_optional_datetime(&row.get::<String>(11).ok()),
        last_error: row.get::<String>(12).ok(),
        outcome: row.get::<String>(13).ok(),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_lead(row: &libsql::Row) -> Result<ExtractedLead, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("lead row: {e}"));
    let id: String = row.get(0).map_err(parse_err)?;
    let conversation_id: String = row.get(1).map_err(parse_err)?;
    let contact_info: String = row.get(2).map_err(parse_err)?;
    let created_at: String = row.get(8).map_err(parse_err)?;
    let updated_at: String = row.get(9).map_err(parse_err)?;

    Ok(ExtractedLead {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        contact_info: serde_json::from_str::<LeadFields>(&contact_info)
            .map_err(|e| DatabaseError::Serialization(format!("contact_info: {e}")))?,
        qualification_score: u8::try_from(row.get::<i64>(3).map_err(parse_err)?)
            .map_err(|e| DatabaseError::Serialization(format!("qualification_score: {e}")))?,
        qualification_reason: row.get(4).map_err(parse_err)?,
        next_action: row.get(5).map_err(parse_err)?,
        booked_at: parse_optional_datetime(&row.get::<String>(6).ok()),
        meeting_link: row.get::<String>(7).ok(),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_dispatch_failure(row: &libsql::Row) -> Result<DispatchFailure, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("dispatch_failure row: {e}"));
    let id: String = row.get(0).map_err(parse_err)?;
    let conversation_id: String = row.get(1).map_err(parse_err)?;
    let agent_config_id: String = row.get(2).map_err(parse_err)?;
    let platform: String = row.get(3).map_err(parse_err)?;
    let created_at: String = row.get(7).map_err(parse_err)?;

    Ok(DispatchFailure {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        agent_config_id: parse_uuid(&agent_config_id)?,
        platform: platform.parse().map_err(DatabaseError::Serialization)?,
        recipient_id: row.get(4).map_err(parse_err)?,
        reply_text: row.get(5).map_err(parse_err)?,
        error: row.get(6).map_err(parse_err)?,
        created_at: parse_datetime(&created_at),
    })
}

async fn count(conn: &Connection, sql: &str, id: &str) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, params![id])
        .await
        .map_err(|e| DatabaseError::Query(format!("agent_stats: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let n: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("agent_stats: {e}")))?;
            Ok(u64::try_from(n).unwrap_or(0))
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("agent_stats: {e}"))),
    }
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Agent configs ───────────────────────────────────────────────

    async fn find_config_by_platform_account(
        &self,
        platform: Platform,
        account_id: &str,
    ) -> Result<Option<AgentConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT a.id, a.name, a.system_prompt, a.qualification_criteria, a.is_active, a.access_token \
                 FROM platform_accounts p JOIN agent_configs a ON a.id = p.agent_config_id \
                 WHERE p.platform = ?1 AND p.account_id = ?2",
                params![platform.as_str(), account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_config_by_platform_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_agent_config(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_config_by_platform_account: {e}"
            ))),
        }
    }

    async fn get_agent_config(&self, id: Uuid) -> Result<Option<AgentConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, system_prompt, qualification_criteria, is_active, access_token \
                 FROM agent_configs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent_config: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_agent_config(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_agent_config: {e}"))),
        }
    }

    async fn upsert_agent_config(&self, config: &AgentConfig) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let criteria = serde_json::to_string(&config.qualification_criteria)
            .map_err(|e| DatabaseError::Serialization(format!("qualification_criteria: {e}")))?;
        let token = config
            .access_token
            .as_ref()
            .map(|t| t.expose_secret().to_string());

        self.conn()
            .execute(
                "INSERT INTO agent_configs (id, name, system_prompt, qualification_criteria, is_active, access_token, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, system_prompt = excluded.system_prompt, \
                 qualification_criteria = excluded.qualification_criteria, is_active = excluded.is_active, \
                 access_token = excluded.access_token, updated_at = excluded.updated_at",
                params![
                    config.id.to_string(),
                    config.name.clone(),
                    config.system_prompt.clone(),
                    criteria,
                    i64::from(config.is_active),
                    opt_text(token.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| map_write_error("upsert_agent_config", e))?;

        debug!(agent_config_id = %config.id, "Agent config upserted");
        Ok(())
    }

    async fn link_platform_account(
        &self,
        platform: Platform,
        account_id: &str,
        agent_config_id: Uuid,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO platform_accounts (platform, account_id, agent_config_id) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(platform, account_id) DO UPDATE SET agent_config_id = excluded.agent_config_id",
                params![platform.as_str(), account_id, agent_config_id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("link_platform_account", e))?;
        Ok(())
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn find_open_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one_conversation(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                 WHERE agent_config_id = ?1 AND platform = ?2 AND external_user_id = ?3 \
                 AND status IN ('pending', 'active')"
            ),
            params![
                key.agent_config_id.to_string(),
                key.platform.as_str(),
                key.external_user_id.clone()
            ],
            "find_open_conversation",
        )
        .await
    }

    async fn create_conversation(
        &self,
        key: &ConversationKey,
        metadata: serde_json::Value,
    ) -> Result<Conversation, DatabaseError> {
        let id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());
        let metadata = serde_json::to_string(&metadata)
            .map_err(|e| DatabaseError::Serialization(format!("conversation metadata: {e}")))?;

        // The partial unique index turns a racing second insert into a no-op.
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO conversations (id, agent_config_id, platform, external_user_id, status, metadata, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                params![
                    id.to_string(),
                    key.agent_config_id.to_string(),
                    key.platform.as_str(),
                    key.external_user_id.clone(),
                    metadata,
                    now,
                ],
            )
            .await
            .map_err(|e| map_write_error("create_conversation", e))?;

        if inserted > 0 {
            info!(conversation_id = %id, platform = %key.platform, "Conversation created");
        }

        self.find_open_conversation(key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: key.partition_key(),
            })
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        self.query_one_conversation(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
            "get_conversation",
        )
        .await
    }

    async fn append_turns_and_activate(
        &self,
        conversation_id: Uuid,
        new_turns: &[Turn],
        expected_prior_len: usize,
    ) -> Result<Conversation, DatabaseError> {
        let id = conversation_id.to_string();

        if !new_turns.is_empty() {
            // One multi-row statement: the guard trigger checks every row and
            // the whole insert rolls back on the first violation.
            let mut sql = String::from(
                "INSERT INTO conversation_turns (conversation_id, seq, role, content, created_at, message_id) VALUES ",
            );
            let mut values: Vec<Value> = Vec::with_capacity(new_turns.len() * 6);
            for (i, turn) in new_turns.iter().enumerate() {
                let base = i * 6;
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&format!(
                    "(?{}, ?{}, ?{}, ?{}, ?{}, ?{})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6
                ));
                values.push(Value::Text(id.clone()));
                values.push(Value::Integer((expected_prior_len + i) as i64));
                values.push(Value::Text(turn.role.as_str().to_string()));
                values.push(Value::Text(turn.content.clone()));
                values.push(Value::Text(fmt_ts(turn.timestamp)));
                values.push(opt_text(turn.message_id.as_deref()));
            }

            if let Err(e) = self
                .conn()
                .execute(&sql, libsql::params_from_iter(values))
                .await
            {
                let msg = e.to_string();
                if msg.contains("conversation not found") {
                    return Err(DatabaseError::NotFound {
                        entity: "conversation".into(),
                        id,
                    });
                }
                if msg.contains("UNIQUE constraint failed")
                    || msg.contains("turn sequence mismatch")
                    || msg.contains("turn out of order")
                    || msg.contains("conversation closed")
                {
                    debug!(conversation_id = %conversation_id, expected_prior_len, "Append rejected: {msg}");
                    return Err(DatabaseError::ConcurrentModification {
                        conversation_id,
                        expected_len: expected_prior_len,
                    });
                }
                if msg.contains("turn role out of turn") {
                    return Err(DatabaseError::Constraint(format!(
                        "append_turns_and_activate: {msg}"
                    )));
                }
                return Err(map_write_error("append_turns_and_activate", e));
            }
        }

        self.get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: conversation_id.to_string(),
            })
    }

    async fn close_conversation(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE conversations SET status = 'closed', updated_at = ?1 \
                 WHERE id = ?2 AND status <> 'closed'",
                params![fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("close_conversation", e))?;

        if changed == 0 && self.get_conversation(id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        }
        if changed > 0 {
            info!(conversation_id = %id, status = %ConversationStatus::Closed, "Conversation closed");
        }
        Ok(changed > 0)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn upsert_lead(
        &self,
        conversation_id: Uuid,
        fields: &LeadUpsert,
    ) -> Result<ExtractedLead, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let contact_info = serde_json::to_string(&fields.contact_info)
            .map_err(|e| DatabaseError::Serialization(format!("contact_info: {e}")))?;

        // A booked lead keeps its next action across re-qualification.
        self.query_one_lead(
            &format!(
                "INSERT INTO extracted_leads (id, conversation_id, contact_info, qualification_score, qualification_reason, next_action, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
                 ON CONFLICT(conversation_id) DO UPDATE SET \
                 contact_info = excluded.contact_info, \
                 qualification_score = excluded.qualification_score, \
                 qualification_reason = excluded.qualification_reason, \
                 next_action = CASE WHEN extracted_leads.booked_at IS NOT NULL \
                     THEN extracted_leads.next_action ELSE excluded.next_action END, \
                 updated_at = excluded.updated_at \
                 RETURNING {LEAD_COLUMNS}"
            ),
            params![
                Uuid::new_v4().to_string(),
                conversation_id.to_string(),
                contact_info,
                i64::from(fields.qualification_score),
                fields.qualification_reason.clone(),
                fields.next_action.clone(),
                now,
            ],
            "upsert_lead",
        )
        .await?
        .ok_or_else(|| DatabaseError::Query("upsert_lead: no row returned".into()))
    }

    async fn get_lead(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<ExtractedLead>, DatabaseError> {
        self.query_one_lead(
            &format!("SELECT {LEAD_COLUMNS} FROM extracted_leads WHERE conversation_id = ?1"),
            params![conversation_id.to_string()],
            "get_lead",
        )
        .await
    }

    async fn mark_lead_booked(
        &self,
        conversation_id: Uuid,
        meeting_link: &str,
    ) -> Result<ExtractedLead, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.query_one_lead(
            &format!(
                "UPDATE extracted_leads SET booked_at = ?1, meeting_link = ?2, next_action = ?3, updated_at = ?1 \
                 WHERE conversation_id = ?4 RETURNING {LEAD_COLUMNS}"
            ),
            params![
                now,
                meeting_link,
                BOOKED_NEXT_ACTION,
                conversation_id.to_string()
            ],
            "mark_lead_booked",
        )
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "lead".into(),
            id: conversation_id.to_string(),
        })
    }

    async fn agent_stats(&self, agent_config_id: Uuid) -> Result<AgentStats, DatabaseError> {
        let conn = self.conn();
        let id = agent_config_id.to_string();

        let total = count(
            conn,
            "SELECT COUNT(*) FROM conversations WHERE agent_config_id = ?1",
            &id,
        )
        .await?;
        let active = count(
            conn,
            "SELECT COUNT(*) FROM conversations WHERE agent_config_id = ?1 AND status = 'active'",
            &id,
        )
        .await?;
        let qualified = count(
            conn,
            "SELECT COUNT(*) FROM extracted_leads l JOIN conversations c ON c.id = l.conversation_id \
             WHERE c.agent_config_id = ?1",
            &id,
        )
        .await?;
        let booked = count(
            conn,
            "SELECT COUNT(*) FROM extracted_leads l JOIN conversations c ON c.id = l.conversation_id \
             WHERE c.agent_config_id = ?1 AND l.booked_at IS NOT NULL",
            &id,
        )
        .await?;

        Ok(AgentStats::new(total, active, qualified, booked))
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &NewJob) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let payload = serde_json::to_string(&job.job)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;
        let agent = job.agent_config_id.map(|id| id.to_string());

        self.conn()
            .execute(
                "INSERT INTO jobs (id, kind, payload, partition_key, agent_config_id, status, attempts, max_attempts, available_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8, ?8)",
                params![
                    job.id.to_string(),
                    job.job.name(),
                    payload,
                    job.partition_key.clone(),
                    opt_text(agent.as_deref()),
                    i64::from(job.max_attempts),
                    fmt_ts(job.available_at),
                    now,
                ],
            )
            .await
            .map_err(|e| map_write_error("insert_job", e))?;
        Ok(())
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, DatabaseError> {
        // A single statement: selection and lease acquisition cannot interleave
        // with another claimer.
        let sql = format!(
            "UPDATE jobs SET status = 'processing', attempts = attempts + 1, \
                 locked_by = ?1, locked_until = ?2, updated_at = ?3 \
             WHERE seq = ( \
                 SELECT j.seq FROM jobs j \
                 WHERE ((j.status = 'pending' AND j.available_at <= ?3) \
                     OR (j.status = 'processing' AND j.locked_until < ?3)) \
                   AND NOT EXISTS ( \
                     SELECT 1 FROM jobs p \
                     WHERE p.partition_key = j.partition_key AND p.seq <> j.seq \
                       AND ((p.seq < j.seq AND p.status IN ('pending', 'processing')) \
                         OR (p.status = 'processing' AND p.locked_until >= ?3))) \
                 ORDER BY j.available_at, j.seq \
                 LIMIT 1) \
             RETURNING {JOB_COLUMNS}"
        );
        let mut jobs = self
            .query_jobs(
                &sql,
                params![worker_id, fmt_ts(lease_until), fmt_ts(now)],
                "claim_job",
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn finish_job(
        &self,
        id: Uuid,
        worker_id: &str,
        status: JobStatus,
        outcome: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, outcome = ?2, locked_by = NULL, locked_until = NULL, updated_at = ?3 \
                 WHERE id = ?4 AND status = 'processing' AND locked_by = ?5",
                params![
                    status.as_str(),
                    opt_text(outcome),
                    fmt_ts(Utc::now()),
                    id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(|e| map_write_error("finish_job", e))?;

        if changed == 0 {
            warn!(job_id = %id, worker_id, "Lease lost before job finished");
        }
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'pending', available_at = ?1, last_error = ?2, \
                 locked_by = NULL, locked_until = NULL, updated_at = ?3 \
                 WHERE id = ?4 AND status = 'processing' AND locked_by = ?5",
                params![
                    fmt_ts(available_at),
                    error,
                    fmt_ts(Utc::now()),
                    id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(|e| map_write_error("reschedule_job", e))?;

        if changed == 0 {
            warn!(job_id = %id, worker_id, "Lease lost before job was rescheduled");
        }
        Ok(())
    }

    async fn dead_letter_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'dead', last_error = ?1, \
                 locked_by = NULL, locked_until = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'processing' AND locked_by = ?4",
                params![error, fmt_ts(Utc::now()), id.to_string(), worker_id],
            )
            .await
            .map_err(|e| map_write_error("dead_letter_job", e))?;

        if changed == 0 {
            warn!(job_id = %id, worker_id, "Lease lost before job was dead-lettered");
        }
        Ok(())
    }

    async fn cancel_pending_jobs(&self, agent_config_id: Uuid) -> Result<u64, DatabaseError> {
        let cancelled = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'cancelled', updated_at = ?1 \
                 WHERE agent_config_id = ?2 AND status = 'pending'",
                params![fmt_ts(Utc::now()), agent_config_id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("cancel_pending_jobs", e))?;
        Ok(cancelled)
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY updated_at DESC, seq DESC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
            "list_jobs_by_status",
        )
        .await
    }

    async fn requeue_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'pending', attempts = 0, available_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'dead'",
                params![fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("requeue_job", e))?;
        Ok(changed > 0)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.pop())
    }

    // ── Dispatch failures ───────────────────────────────────────────

    async fn record_dispatch_failure(
        &self,
        failure: &DispatchFailure,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO dispatch_failures (id, conversation_id, agent_config_id, platform, recipient_id, reply_text, error, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    failure.id.to_string(),
                    failure.conversation_id.to_string(),
                    failure.agent_config_id.to_string(),
                    failure.platform.as_str(),
                    failure.recipient_id.clone(),
                    failure.reply_text.clone(),
                    failure.error.clone(),
                    fmt_ts(failure.created_at),
                ],
            )
            .await
            .map_err(|e| map_write_error("record_dispatch_failure", e))?;
        Ok(())
    }

    async fn list_dispatch_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<DispatchFailure>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, agent_config_id, platform, recipient_id, reply_text, error, created_at \
                 FROM dispatch_failures ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatch_failures: {e}")))?;

        let mut failures = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatch_failures: {e}")))?
        {
            failures.push(row_to_dispatch_failure(&row)?);
        }
        Ok(failures)
    }
}
