//! Confirmation email for newly created accounts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tracing::{Instrument, info_span};

pub const CONFIRM_ACCOUNT_TEMPLATE: &str = "confirm_account";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationEmail {
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub confirm_link: String,
    pub site_fullname: String,
}

impl ConfirmationEmail {
    /// JSON payload stored with the outbox row.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        json!({
            "username": self.username,
            "firstname": self.firstname,
            "lastname": self.lastname,
            "email": self.email,
            "link": self.confirm_link,
            "sitename": self.site_fullname,
        })
    }
}

#[async_trait]
pub trait ConfirmationMailer: Send + Sync {
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<()>;
}

/// Queue the confirmation email in `email_outbox`; the outbox worker delivers it.
#[derive(Clone, Debug)]
pub struct OutboxMailer {
    pool: PgPool,
}

impl OutboxMailer {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfirmationMailer for OutboxMailer {
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<()> {
        let payload_text = serde_json::to_string(&email.payload())
            .context("failed to serialize email payload")?;

        let query = r"
            INSERT INTO email_outbox (to_email, template, payload_json)
            VALUES ($1, $2, $3::jsonb)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&email.email)
            .bind(CONFIRM_ACCOUNT_TEMPLATE)
            .bind(payload_text)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert email outbox row")?;

        Ok(())
    }
}
