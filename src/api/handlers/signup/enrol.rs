//! Enrolment token redemption.
//!
//! A token grants a seat in one course. Redemption happens right after the
//! account is created; a token that cannot be redeemed never blocks signup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::storage::NewUser;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnrolmentOutcome {
    Enrolled { course_id: i64 },
    UnknownToken,
    Expired,
    Exhausted,
}

#[async_trait]
pub trait EnrolmentTokenPlugin: Send + Sync {
    /// Enrol a freshly created (still unconfirmed) user using `token`.
    ///
    /// # Errors
    /// Infrastructure failures only; token problems are reported as outcomes.
    async fn perform_trusted_enrolment(
        &self,
        token: &str,
        user_id: Uuid,
        user: &NewUser,
    ) -> Result<EnrolmentOutcome>;
}

/// Tokens stored in `enrol_tokens`, seats tracked in `seats_used`.
#[derive(Clone, Debug)]
pub struct PgTokenEnrolment {
    pool: PgPool,
}

impl PgTokenEnrolment {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrolmentTokenPlugin for PgTokenEnrolment {
    async fn perform_trusted_enrolment(
        &self,
        token: &str,
        user_id: Uuid,
        _user: &NewUser,
    ) -> Result<EnrolmentOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin enrolment transaction")?;

        let query = r"
            SELECT course_id,
                   seats_total,
                   seats_used,
                   (expires_at IS NOT NULL AND expires_at <= NOW()) AS expired
            FROM enrol_tokens
            WHERE token = $1
            FOR UPDATE
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lookup enrolment token")?;

        let Some(row) = row else {
            return Ok(EnrolmentOutcome::UnknownToken);
        };
        let course_id: i64 = row.get("course_id");
        let seats_total: Option<i32> = row.get("seats_total");
        let seats_used: i32 = row.get("seats_used");
        let expired: bool = row.get("expired");

        if expired {
            return Ok(EnrolmentOutcome::Expired);
        }
        if seats_total.is_some_and(|total| seats_used >= total) {
            return Ok(EnrolmentOutcome::Exhausted);
        }

        let query = r"
            INSERT INTO enrolments (user_id, course_id, token)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, course_id) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let inserted = sqlx::query(query)
            .bind(user_id)
            .bind(course_id)
            .bind(token)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert enrolment")?
            .rows_affected();

        if inserted > 0 {
            let query = "UPDATE enrol_tokens SET seats_used = seats_used + 1 WHERE token = $1";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(token)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to consume enrolment seat")?;
        }

        tx.commit().await.context("commit enrolment transaction")?;
        Ok(EnrolmentOutcome::Enrolled { course_id })
    }
}
