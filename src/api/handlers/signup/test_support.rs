//! In-memory collaborators for signup handler tests.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    body::to_bytes,
    http::{
        HeaderMap, HeaderValue,
        header::{COOKIE, LOCATION, SET_COOKIE},
    },
    response::Response,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    consent::MemoryPresignupCache,
    enrol::{EnrolmentOutcome, EnrolmentTokenPlugin},
    events::{EventBus, SignupEvent},
    hooks::SignupHook,
    mailer::{ConfirmationEmail, ConfirmationMailer},
    session::{MemorySessionStore, SESSION_COOKIE_NAME, SessionData, SessionStore},
    state::{SignupState, SiteConfig},
    storage::{ConfirmationRecord, CreateOutcome, NewUser, UserRepository},
};

pub(super) const WWWROOT: &str = "https://learn.example.com";

pub(super) fn site_config() -> SiteConfig {
    SiteConfig::new(WWWROOT, "Example Learning".to_string())
}

#[derive(Clone, Debug)]
pub(super) struct StoredUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub auth: String,
    pub lang: String,
    pub calendar_type: Option<String>,
    pub secret: String,
    pub password_hash: String,
    pub confirmed: bool,
    pub policy_agreed: bool,
}

#[derive(Default)]
struct UserTables {
    users: Vec<StoredUser>,
    password_history: Vec<(Uuid, String)>,
    profile_fields: BTreeMap<(Uuid, String), String>,
    preferences: HashMap<(Uuid, String), String>,
}

#[derive(Default)]
pub(super) struct MemoryUserRepository {
    tables: Mutex<UserTables>,
    // Another request grabs the username between the check and the insert.
    lose_username_race: bool,
}

impl MemoryUserRepository {
    pub(super) async fn insert_existing(&self, username: &str, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.lock().await.users.push(StoredUser {
            id,
            username: username.to_string(),
            email: email.to_string(),
            firstname: "Existing".to_string(),
            lastname: "User".to_string(),
            auth: "email".to_string(),
            lang: "en".to_string(),
            calendar_type: None,
            secret: "existingsecret1".to_string(),
            password_hash: String::new(),
            confirmed: true,
            policy_agreed: false,
        });
        id
    }

    pub(super) async fn user(&self, username: &str) -> Option<StoredUser> {
        self.tables
            .lock()
            .await
            .users
            .iter()
            .find(|user| user.username == username)
            .cloned()
    }

    pub(super) async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub(super) async fn preference(&self, user_id: Uuid, name: &str) -> Option<String> {
        self.tables
            .lock()
            .await
            .preferences
            .get(&(user_id, name.to_string()))
            .cloned()
    }

    pub(super) async fn profile_field(&self, user_id: Uuid, field: &str) -> Option<String> {
        self.tables
            .lock()
            .await
            .profile_fields
            .get(&(user_id, field.to_string()))
            .cloned()
    }

    pub(super) async fn password_history_len(&self, user_id: Uuid) -> usize {
        self.tables
            .lock()
            .await
            .password_history
            .iter()
            .filter(|(id, _)| *id == user_id)
            .count()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn username_exists(&self, username: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .users
            .iter()
            .any(|user| user.username == username))
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .users
            .iter()
            .any(|user| user.email.eq_ignore_ascii_case(email)))
    }

    async fn create_user(&self, user: &NewUser, password_hash: &str) -> Result<CreateOutcome> {
        let mut tables = self.tables.lock().await;
        if self.lose_username_race
            || tables
                .users
                .iter()
                .any(|stored| stored.username == user.username)
        {
            return Ok(CreateOutcome::Conflict);
        }
        let id = Uuid::new_v4();
        tables.users.push(StoredUser {
            id,
            username: user.username.clone(),
            email: user.email.clone(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            auth: user.auth.clone(),
            lang: user.lang.clone(),
            calendar_type: user.calendar_type.clone(),
            secret: user.secret.clone(),
            password_hash: password_hash.to_string(),
            confirmed: user.confirmed,
            policy_agreed: user.policy_agreed,
        });
        Ok(CreateOutcome::Created(id))
    }

    async fn add_password_history(
        &self,
        user_id: Uuid,
        password_hash: &str,
        keep: u32,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables
            .password_history
            .push((user_id, password_hash.to_string()));
        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
        let mut seen = 0;
        let mut kept: Vec<(Uuid, String)> = Vec::new();
        for entry in tables.password_history.iter().rev() {
            if entry.0 == user_id {
                seen += 1;
                if seen > keep {
                    continue;
                }
            }
            kept.push(entry.clone());
        }
        kept.reverse();
        tables.password_history = kept;
        Ok(())
    }

    async fn save_profile_fields(
        &self,
        user_id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        for (field, data) in fields {
            tables
                .profile_fields
                .insert((user_id, field.clone()), data.clone());
        }
        Ok(())
    }

    async fn set_preference(&self, user_id: Uuid, name: &str, value: &str) -> Result<()> {
        self.tables
            .lock()
            .await
            .preferences
            .insert((user_id, name.to_string()), value.to_string());
        Ok(())
    }

    async fn take_preference(&self, user_id: Uuid, name: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .lock()
            .await
            .preferences
            .remove(&(user_id, name.to_string())))
    }

    async fn find_for_confirmation(&self, username: &str) -> Result<Option<ConfirmationRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .users
            .iter()
            .find(|user| user.username == username)
            .map(|user| ConfirmationRecord {
                user_id: user.id,
                username: user.username.clone(),
                firstname: user.firstname.clone(),
                lastname: user.lastname.clone(),
                secret: user.secret.clone(),
                confirmed: user.confirmed,
            }))
    }

    async fn confirm_user(&self, user_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .iter_mut()
            .find(|user| user.id == user_id)
            .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
        user.confirmed = true;
        Ok(())
    }
}

#[derive(Default)]
pub(super) struct RecordingEventBus {
    events: Mutex<Vec<SignupEvent>>,
}

impl RecordingEventBus {
    pub(super) async fn events(&self) -> Vec<SignupEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: SignupEvent) {
        self.events.lock().await.push(event);
    }
}

#[derive(Default)]
pub(super) struct RecordingMailer {
    fail: bool,
    sent: Mutex<Vec<ConfirmationEmail>>,
}

impl RecordingMailer {
    pub(super) async fn sent(&self) -> Vec<ConfirmationEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl ConfirmationMailer for RecordingMailer {
    async fn send_confirmation(&self, email: &ConfirmationEmail) -> Result<()> {
        if self.fail {
            return Err(anyhow!("mail transport unavailable"));
        }
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

pub(super) struct FakeEnrolment {
    outcome: EnrolmentOutcome,
    calls: Mutex<Vec<(String, Uuid)>>,
}

impl FakeEnrolment {
    pub(super) async fn calls(&self) -> Vec<(String, Uuid)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl EnrolmentTokenPlugin for FakeEnrolment {
    async fn perform_trusted_enrolment(
        &self,
        token: &str,
        user_id: Uuid,
        _user: &NewUser,
    ) -> Result<EnrolmentOutcome> {
        self.calls.lock().await.push((token.to_string(), user_id));
        Ok(self.outcome)
    }
}

pub(super) struct HarnessOptions {
    pub config: SiteConfig,
    pub enrolment: Option<EnrolmentOutcome>,
    pub mailer_fails: bool,
    pub username_race: bool,
    pub hooks: Vec<Arc<dyn SignupHook>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            config: site_config(),
            enrolment: Some(EnrolmentOutcome::Enrolled { course_id: 42 }),
            mailer_fails: false,
            username_race: false,
            hooks: Vec::new(),
        }
    }
}

/// Signup state wired to in-memory collaborators the test can inspect.
pub(super) struct Harness {
    pub state: Arc<SignupState>,
    pub users: Arc<MemoryUserRepository>,
    pub sessions: Arc<MemorySessionStore>,
    pub presignup: Arc<MemoryPresignupCache>,
    pub events: Arc<RecordingEventBus>,
    pub mailer: Arc<RecordingMailer>,
    pub enrolment: Option<Arc<FakeEnrolment>>,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub(super) fn with_options(options: HarnessOptions) -> Self {
        let users = Arc::new(MemoryUserRepository {
            lose_username_race: options.username_race,
            ..MemoryUserRepository::default()
        });
        let sessions = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        let presignup = Arc::new(MemoryPresignupCache::new(options.config.presignup_ttl()));
        let events = Arc::new(RecordingEventBus::default());
        let mailer = Arc::new(RecordingMailer {
            fail: options.mailer_fails,
            sent: Mutex::new(Vec::new()),
        });
        let enrolment = options.enrolment.map(|outcome| {
            Arc::new(FakeEnrolment {
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        });

        let mut state = SignupState::new(
            options.config,
            users.clone(),
            sessions.clone(),
            presignup.clone(),
            events.clone(),
            mailer.clone(),
        )
        .with_enrolment(
            enrolment
                .clone()
                .map(|plugin| plugin as Arc<dyn EnrolmentTokenPlugin>),
        );
        for hook in options.hooks {
            state = state.with_hook(hook);
        }

        Self {
            state: Arc::new(state),
            users,
            sessions,
            presignup,
            events,
            mailer,
            enrolment,
        }
    }

    /// Store `data` under a fixed session id and return a request cookie for it.
    pub(super) async fn session(&self, data: SessionData) -> Result<HeaderMap> {
        let id = "test-session";
        self.sessions.save(id, data).await;
        cookie_headers(id)
    }

    pub(super) async fn session_data(&self, headers: &HeaderMap) -> Option<SessionData> {
        let id = session_id(headers)?;
        self.sessions.load(&id).await
    }
}

pub(super) fn cookie_headers(session_id: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(&format!("{SESSION_COOKIE_NAME}={session_id}"))?,
    );
    Ok(headers)
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(COOKIE)?.to_str().ok()?;
    value
        .strip_prefix(&format!("{SESSION_COOKIE_NAME}="))
        .map(ToString::to_string)
}

/// Request headers carrying the session cookie a response just set.
pub(super) fn follow_cookie(response: &Response) -> Result<HeaderMap> {
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .context("missing Set-Cookie")?
        .to_str()?;
    let pair = set_cookie.split(';').next().unwrap_or_default();
    let id = pair
        .strip_prefix(&format!("{SESSION_COOKIE_NAME}="))
        .context("unexpected cookie name")?;
    cookie_headers(id)
}

pub(super) fn location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

pub(super) async fn body_json(response: Response) -> Result<serde_json::Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
