//! Webhook gateway: handshake, signature check and inbound normalization.
//!
//! Every accepted message becomes one `process-message` job, partitioned by
//! its conversation triple so messages of one prospect are answered in order.

pub mod payload;
pub mod routes;
pub mod signature;

pub use payload::{InboundMessage, WebhookPayload};
pub use routes::webhook_routes;
pub use signature::{SIGNATURE_HEADER, sign, token_matches, verify_signature};

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::conversation::ConversationKey;
use crate::error::WebhookError;
use crate::queue::{ConversationTarget, Job, JobQueue, ProcessMessageJob, Sender};
use crate::store::Database;

pub struct WebhookGateway {
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
    verify_token: SecretString,
    app_secret: Option<SecretString>,
}

impl WebhookGateway {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<JobQueue>,
        verify_token: SecretString,
        app_secret: Option<SecretString>,
    ) -> Self {
        if app_secret.is_none() {
            warn!("No app secret configured, webhook signatures are not verified");
        }
        Self {
            db,
            queue,
            verify_token,
            app_secret,
        }
    }

    /// Subscription handshake: echo `challenge` iff the mode and token match.
    pub fn verify_handshake(
        &self,
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<String, WebhookError> {
        match (mode, token) {
            (Some("subscribe"), Some(token)) if token_matches(&self.verify_token, token) => {
                info!("Webhook subscription verified");
                Ok(challenge.unwrap_or_default().to_string())
            }
            _ => {
                warn!(mode = ?mode, "Webhook handshake rejected");
                Err(WebhookError::HandshakeRejected)
            }
        }
    }

    /// Verify the signature header, when an app secret is configured.
    pub fn check_signature(&self, header: Option<&str>, body: &[u8]) -> Result<(), WebhookError> {
        match &self.app_secret {
            Some(secret) => verify_signature(secret, header, body),
            None => Ok(()),
        }
    }

    /// Normalize an event body and enqueue its messages. Returns how many
    /// were enqueued.
    ///
    /// Every message is attempted; the last enqueue error, if any, is returned.
    pub async fn handle_event(&self, body: &[u8]) -> Result<usize, WebhookError> {
        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let mut accepted = 0;
        let mut last_error = None;
        for message in payload.into_messages() {
            match self.enqueue(message).await {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to enqueue inbound message");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(accepted),
        }
    }

    async fn enqueue(&self, message: InboundMessage) -> Result<bool, WebhookError> {
        let Some(agent) = self
            .db
            .find_config_by_platform_account(message.platform, &message.account_id)
            .await?
        else {
            warn!(
                platform = %message.platform,
                account_id = %message.account_id,
                "No agent linked to account, message dropped"
            );
            return Ok(false);
        };

        let key = ConversationKey::new(agent.id, message.platform, message.sender_id.clone());
        let partition = key.partition_key();
        let job = Job::ProcessMessage(ProcessMessageJob {
            target: ConversationTarget::Key {
                conversation_key: key,
            },
            text: message.text,
            sender: Sender {
                id: message.sender_id,
                name: None,
            },
            attachments: message.attachments,
            timestamp: message.timestamp,
            is_postback: message.is_postback,
            postback_payload: message.postback_payload,
            message_id: message.message_id.clone(),
            account_id: Some(message.account_id),
        });

        let job_id = self.queue.enqueue(job, partition, Some(agent.id)).await?;
        debug!(%job_id, message_id = ?message.message_id, "Inbound message queued");
        Ok(true)
    }
}
