//! User account storage used by signup and confirmation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::utils::is_unique_violation;

/// Preference holding the page to return to after confirming the account.
pub const WANTSURL_PREFERENCE: &str = "auth_email_wantsurl";

/// Account about to be created, after validation and setup.
#[derive(Clone)]
pub struct NewUser {
    pub username: String,
    pub password: SecretString,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub city: String,
    pub country: String,
    pub auth: String,
    pub lang: String,
    pub calendar_type: Option<String>,
    pub confirmed: bool,
    pub first_access: i64,
    pub time_created: i64,
    pub secret: String,
    pub policy_agreed: bool,
    pub token: Option<String>,
    pub profile_fields: BTreeMap<String, String>,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("username", &self.username)
            .field("password", &"***")
            .field("email", &self.email)
            .field("auth", &self.auth)
            .field("confirmed", &self.confirmed)
            .field("secret", &"***")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    Conflict,
}

/// Fields needed to confirm an account from the emailed link.
#[derive(Debug, Clone)]
pub struct ConfirmationRecord {
    pub user_id: Uuid,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub secret: String,
    pub confirmed: bool,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn username_exists(&self, username: &str) -> Result<bool>;
    async fn email_exists(&self, email: &str) -> Result<bool>;
    async fn create_user(&self, user: &NewUser, password_hash: &str) -> Result<CreateOutcome>;
    /// Record a password hash and keep only the newest `keep` entries.
    async fn add_password_history(&self, user_id: Uuid, password_hash: &str, keep: u32)
    -> Result<()>;
    async fn save_profile_fields(
        &self,
        user_id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn set_preference(&self, user_id: Uuid, name: &str, value: &str) -> Result<()>;
    /// Read and delete a preference.
    async fn take_preference(&self, user_id: Uuid, name: &str) -> Result<Option<String>>;
    async fn find_for_confirmation(&self, username: &str) -> Result<Option<ConfirmationRecord>>;
    async fn confirm_user(&self, user_id: Uuid) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn username_exists(&self, username: &str) -> Result<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM users WHERE username = $1) AS exists";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(username)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to check username")?;
        Ok(row.get("exists"))
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM users WHERE lower(email) = lower($1)) AS exists";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to check email")?;
        Ok(row.get("exists"))
    }

    async fn create_user(&self, user: &NewUser, password_hash: &str) -> Result<CreateOutcome> {
        let query = r"
            INSERT INTO users
                (username, password_hash, email, firstname, lastname, city, country,
                 auth, lang, calendar_type, confirmed, first_access, time_created,
                 secret, policy_agreed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&user.username)
            .bind(password_hash)
            .bind(&user.email)
            .bind(&user.firstname)
            .bind(&user.lastname)
            .bind(&user.city)
            .bind(&user.country)
            .bind(&user.auth)
            .bind(&user.lang)
            .bind(&user.calendar_type)
            .bind(user.confirmed)
            .bind(user.first_access)
            .bind(user.time_created)
            .bind(&user.secret)
            .bind(user.policy_agreed)
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

        match row {
            Ok(row) => Ok(CreateOutcome::Created(row.get("id"))),
            Err(err) if is_unique_violation(&err) => Ok(CreateOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn add_password_history(
        &self,
        user_id: Uuid,
        password_hash: &str,
        keep: u32,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin password history transaction")?;

        let query = "INSERT INTO user_password_history (user_id, hash) VALUES ($1, $2)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert password history")?;

        let query = r"
            DELETE FROM user_password_history
            WHERE user_id = $1
              AND id NOT IN (
                SELECT id FROM user_password_history
                WHERE user_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
              )
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(i64::from(keep))
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to prune password history")?;

        tx.commit()
            .await
            .context("commit password history transaction")?;
        Ok(())
    }

    async fn save_profile_fields(
        &self,
        user_id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        let query = r"
            INSERT INTO user_info_data (user_id, field, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, field) DO UPDATE SET data = EXCLUDED.data
        ";
        for (field, data) in fields {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(user_id)
                .bind(field)
                .bind(data)
                .execute(&self.pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to save profile field {field}"))?;
        }
        Ok(())
    }

    async fn set_preference(&self, user_id: Uuid, name: &str, value: &str) -> Result<()> {
        let query = r"
            INSERT INTO user_preferences (user_id, name, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, name) DO UPDATE SET value = EXCLUDED.value
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(name)
            .bind(value)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to set user preference")?;
        Ok(())
    }

    async fn take_preference(&self, user_id: Uuid, name: &str) -> Result<Option<String>> {
        let query = "DELETE FROM user_preferences WHERE user_id = $1 AND name = $2 RETURNING value";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to take user preference")?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn find_for_confirmation(&self, username: &str) -> Result<Option<ConfirmationRecord>> {
        let query = r"
            SELECT id, username, firstname, lastname, secret, confirmed
            FROM users
            WHERE username = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user for confirmation")?;

        Ok(row.map(|row| ConfirmationRecord {
            user_id: row.get("id"),
            username: row.get("username"),
            firstname: row.get("firstname"),
            lastname: row.get("lastname"),
            secret: row.get("secret"),
            confirmed: row.get("confirmed"),
        }))
    }

    async fn confirm_user(&self, user_id: Uuid) -> Result<()> {
        let query = "UPDATE users SET confirmed = TRUE WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to confirm user")?;
        Ok(())
    }
}
