//! Visitor sessions: who is signed in, where to return after signup, and the
//! per-session `sesskey` guarding state-changing links.
//!
//! Anonymous visitors get a session too, since the return-to URL, the policy
//! agreement flag, and the presignup cache are all keyed by session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{Rng, RngCore, distributions::Alphanumeric, rngs::OsRng};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::state::SiteConfig;

pub const SESSION_COOKIE_NAME: &str = "enrolgate_session";
const SESSKEY_LENGTH: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: Uuid,
    pub username: String,
    pub fullname: String,
    pub is_guest: bool,
}

#[derive(Clone, Debug)]
pub struct SessionData {
    pub user: Option<SessionUser>,
    pub wants_url: Option<String>,
    pub sesskey: String,
    pub policy_agreed: bool,
}

impl SessionData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            user: None,
            wants_url: None,
            sesskey: generate_sesskey(),
            policy_agreed: false,
        }
    }

    /// Logged in as a real account (the guest user does not count).
    #[must_use]
    pub fn is_logged_in_user(&self) -> bool {
        self.user.as_ref().is_some_and(|user| !user.is_guest)
    }
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Option<SessionData>;
    async fn save(&self, id: &str, data: SessionData);
    async fn remove(&self, id: &str);
}

struct StoredSession {
    data: SessionData,
    touched_at: Instant,
}

/// Process-local session store; idle sessions expire after the TTL.
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn prune(&self, sessions: &mut HashMap<String, StoredSession>) {
        sessions.retain(|_, entry| entry.touched_at.elapsed() < self.ttl);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Option<SessionData> {
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions);
        sessions.get_mut(id).map(|entry| {
            entry.touched_at = Instant::now();
            entry.data.clone()
        })
    }

    async fn save(&self, id: &str, data: SessionData) {
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions);
        sessions.insert(
            id.to_string(),
            StoredSession {
                data,
                touched_at: Instant::now(),
            },
        );
    }

    async fn remove(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }
}

/// Session bound to the current request.
#[derive(Debug)]
pub struct Session {
    id: String,
    is_new: bool,
    pub data: SessionData,
}

impl Session {
    /// Resume the session named by the cookie, or start a fresh one.
    ///
    /// # Errors
    /// Returns an error if a new session id cannot be generated.
    pub async fn open(headers: &HeaderMap, store: &dyn SessionStore) -> Result<Self> {
        if let Some(id) = extract_session_id(headers) {
            if let Some(data) = store.load(&id).await {
                return Ok(Self {
                    id,
                    is_new: false,
                    data,
                });
            }
        }
        Ok(Self {
            id: generate_session_id()?,
            is_new: true,
            data: SessionData::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn commit(&self, store: &dyn SessionStore) {
        store.save(&self.id, self.data.clone()).await;
    }

    /// `Set-Cookie` value for sessions created during this request.
    pub fn cookie(&self, config: &SiteConfig) -> Option<HeaderValue> {
        if !self.is_new {
            return None;
        }
        session_cookie(config, &self.id).ok()
    }
}

/// Build an `HttpOnly` cookie carrying the session id.
pub(super) fn session_cookie(
    config: &SiteConfig,
    id: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        (key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty())
            .then(|| val.trim().to_string())
    })
}

fn generate_session_id() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session id")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

fn generate_sesskey() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSKEY_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> SiteConfig {
        SiteConfig::new("https://learn.example.com", "Example".to_string())
    }

    #[test]
    fn extract_session_id_reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; enrolgate_session=abc123; other=1"),
        );
        assert_eq!(extract_session_id(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn extract_session_id_ignores_empty_or_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_session_id(&headers), None);
        headers.insert(COOKIE, HeaderValue::from_static("enrolgate_session="));
        assert_eq!(extract_session_id(&headers), None);
    }

    #[test]
    fn session_cookie_is_secure_for_https() {
        let cookie = session_cookie(&config(), "abc").ok();
        let value = cookie.as_ref().and_then(|value| value.to_str().ok());
        assert_eq!(
            value,
            Some("enrolgate_session=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=7200; Secure")
        );
    }

    #[test]
    fn sesskey_is_alphanumeric() {
        let data = SessionData::new();
        assert_eq!(data.sesskey.len(), SESSKEY_LENGTH);
        assert!(data.sesskey.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!data.is_logged_in_user());
    }

    #[test]
    fn guest_is_not_a_logged_in_user() {
        let mut data = SessionData::new();
        data.user = Some(SessionUser {
            user_id: Uuid::new_v4(),
            username: "guest".to_string(),
            fullname: "Guest user".to_string(),
            is_guest: true,
        });
        assert!(!data.is_logged_in_user());
    }

    #[tokio::test]
    async fn open_reuses_stored_session() -> Result<()> {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let first = Session::open(&HeaderMap::new(), &store).await?;
        assert!(first.cookie(&config()).is_some());
        first.commit(&store).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE_NAME}={}", first.id()))?,
        );
        let second = Session::open(&headers, &store).await?;
        assert_eq!(second.id(), first.id());
        assert_eq!(second.data.sesskey, first.data.sesskey);
        assert!(second.cookie(&config()).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_cookie_starts_fresh_session() -> Result<()> {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("enrolgate_session=stale"));
        let session = Session::open(&headers, &store).await?;
        assert_ne!(session.id(), "stale");
        assert!(session.cookie(&config()).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn remove_forgets_session() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.save("abc", SessionData::new()).await;
        assert!(store.load("abc").await.is_some());
        store.remove("abc").await;
        assert!(store.load("abc").await.is_none());
    }

    #[tokio::test]
    async fn save_prunes_expired_sessions() {
        let store = MemorySessionStore::new(Duration::from_millis(20));
        store.save("first", SessionData::new()).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.save("second", SessionData::new()).await;
        assert_eq!(store.len().await, 1);
        assert!(store.load("first").await.is_none());
        assert!(store.load("second").await.is_some());
    }
}
