//! Email outbox worker and delivery backends.
//!
//! Signup enqueues `confirm_account` rows in `email_outbox` with status
//! `pending`. A background task polls that table and leases a batch in one
//! statement (`FOR UPDATE SKIP LOCKED` inside an `UPDATE ... RETURNING`), then
//! hands each row to an `EmailSender` with no transaction open. The row is
//! then marked `sent`, rescheduled with exponential backoff and jitter, or
//! marked `failed` once `max_attempts` is reached.
//!
//! `LogEmailSender` (the default) only logs the payload. `HttpEmailSender`
//! posts the message as JSON to a mail delivery API.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::APP_USER_AGENT;

#[derive(Clone, Debug, Serialize)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct MailApiRequest<'a> {
    to: &'a str,
    template: &'a str,
    data: serde_json::Value,
}

/// Deliver through an HTTP mail API: `POST {endpoint}` with a bearer token.
#[derive(Clone, Debug)]
pub struct HttpEmailSender {
    client: Client,
    endpoint: String,
    token: SecretString,
}

impl HttpEmailSender {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: String, token: SecretString, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build mail API client")?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let data: serde_json::Value = serde_json::from_str(&message.payload_json)
            .context("invalid email payload JSON")?;
        let request = MailApiRequest {
            to: &message.to_email,
            template: &message.template,
            data,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .json(&request)
            .send()
            .await
            .context("mail API request failed")?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow!("mail API responded with {status}"))
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// 5s poll interval, 10 messages per batch, 5 attempts, 5s to 5m backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp zero values and keep `backoff_max >= backoff_base`.
    #[must_use]
    pub fn normalize(self) -> Self {
        let non_zero = |duration: Duration| {
            if duration.is_zero() {
                Duration::from_secs(1)
            } else {
                duration
            }
        };
        let backoff_base = non_zero(self.backoff_base);
        Self {
            poll_interval: non_zero(self.poll_interval),
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How long a claimed row stays invisible to other pollers while it is sent.
const CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Outbox row leased for one delivery attempt.
#[derive(Clone, Debug)]
struct OutboxRow {
    id: Uuid,
    attempts: u32,
    message: EmailMessage,
}

/// Status written back after a delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DeliveryUpdate {
    Sent {
        attempts: i32,
    },
    Retry {
        attempts: i32,
        error: String,
        delay_ms: i64,
    },
    Failed {
        attempts: i32,
        error: String,
    },
}

#[async_trait]
trait OutboxStore: Send + Sync {
    /// Lease up to `limit` due rows by pushing `next_attempt_at` past the lease.
    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<OutboxRow>>;
    async fn record(&self, id: Uuid, update: &DeliveryUpdate) -> Result<()>;
}

struct PgOutboxStore {
    pool: PgPool,
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<OutboxRow>> {
        let query = r"
            UPDATE email_outbox
            SET next_attempt_at = NOW() + ($2 * INTERVAL '1 millisecond')
            WHERE id IN (
                SELECT id
                FROM email_outbox
                WHERE status = 'pending'
                  AND next_attempt_at <= NOW()
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, to_email, template, payload_json::text AS payload_json, attempts
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to claim email outbox batch")?;

        Ok(rows
            .into_iter()
            .map(|row| OutboxRow {
                id: row.get("id"),
                attempts: u32::try_from(row.get::<i32, _>("attempts")).unwrap_or(0),
                message: EmailMessage {
                    to_email: row.get("to_email"),
                    template: row.get("template"),
                    payload_json: row.get("payload_json"),
                },
            })
            .collect())
    }

    async fn record(&self, id: Uuid, update: &DeliveryUpdate) -> Result<()> {
        let (query, context) = match update {
            DeliveryUpdate::Sent { .. } => (
                r"
                UPDATE email_outbox
                SET status = 'sent',
                    attempts = $2,
                    last_error = NULL,
                    sent_at = NOW(),
                    next_attempt_at = NOW()
                WHERE id = $1
                ",
                "failed to update outbox status to sent",
            ),
            DeliveryUpdate::Retry { .. } => (
                r"
                UPDATE email_outbox
                SET status = 'pending',
                    attempts = $2,
                    last_error = $3,
                    next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                WHERE id = $1
                ",
                "failed to update outbox retry schedule",
            ),
            DeliveryUpdate::Failed { .. } => (
                r"
                UPDATE email_outbox
                SET status = 'failed',
                    attempts = $2,
                    last_error = $3,
                    next_attempt_at = NOW()
                WHERE id = $1
                ",
                "failed to update outbox status to failed",
            ),
        };
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );

        let statement = sqlx::query(query).bind(id);
        let statement = match update {
            DeliveryUpdate::Sent { attempts } => statement.bind(*attempts),
            DeliveryUpdate::Retry {
                attempts,
                error,
                delay_ms,
            } => statement.bind(*attempts).bind(error.clone()).bind(*delay_ms),
            DeliveryUpdate::Failed { attempts, error } => {
                statement.bind(*attempts).bind(error.clone())
            }
        };
        statement
            .execute(&self.pool)
            .instrument(span)
            .await
            .context(context)?;
        Ok(())
    }
}

pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let store = PgOutboxStore { pool };
        loop {
            if let Err(err) = process_outbox_batch(&store, sender.as_ref(), &config).await {
                error!("email outbox batch failed: {err}");
            }
            sleep(config.poll_interval()).await;
        }
    })
}

/// Claim a batch, deliver each row, then record each outcome on its own.
///
/// Rows are never locked while the sender runs. A row whose status update
/// fails stays leased until `CLAIM_LEASE` expires.
async fn process_outbox_batch(
    store: &dyn OutboxStore,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let rows = store.claim(config.batch_size(), CLAIM_LEASE).await?;
    let claimed = rows.len();

    for row in rows {
        let send_result = sender.send(&row.message).await;
        let update = delivery_update(row.id, row.attempts, send_result, config);
        if let Err(err) = store.record(row.id, &update).await {
            error!(outbox_id = %row.id, "failed to record email delivery: {err:#}");
        }
    }

    Ok(claimed)
}

fn delivery_update(
    id: Uuid,
    attempts: u32,
    send_result: Result<()>,
    config: &EmailWorkerConfig,
) -> DeliveryUpdate {
    let next_attempt = attempts.saturating_add(1);
    let attempts = i32::try_from(next_attempt).unwrap_or(i32::MAX);

    let Err(err) = send_result else {
        return DeliveryUpdate::Sent { attempts };
    };

    if next_attempt >= config.max_attempts() {
        error!(outbox_id = %id, attempts = next_attempt, "giving up on email: {err}");
        DeliveryUpdate::Failed {
            attempts,
            error: err.to_string(),
        }
    } else {
        let delay = backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
        DeliveryUpdate::Retry {
            attempts,
            error: err.to_string(),
            delay_ms: i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let delay = base.checked_mul(1u32 << shift).unwrap_or(max);
    jitter_delay(delay.min(max))
}

/// Random delay in `[delay / 2, delay]`.
fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
