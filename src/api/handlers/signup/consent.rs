//! Digital age of consent gate.
//!
//! When verification is enabled, a visitor must state age and country before
//! the signup form is shown. The answer is kept in the presignup cache for the
//! visitor's session, with three states:
//!
//! - unset: not verified yet, signup redirects to the verification page;
//! - `"yes"`: the visitor is a digital minor, signup redirects to a notice;
//! - `"no"`: the visitor may continue.
//!
//! Entries expire after the presignup TTL so a shared device does not keep a
//! stale answer.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{
    session::Session,
    state::{SignupState, SiteConfig},
    strings,
    types::{AgeLocationSubmission, FieldError, Outcome, Page, respond},
};

pub const IS_MINOR_KEY: &str = "isminor";
const DEFAULT_COUNTRY_KEY: &str = "*";

/// Default age of digital consent per country, `*` for everywhere else.
pub const DEFAULT_AGE_OF_CONSENT_MAP: &str = "*, 16
AT, 14
BE, 13
BG, 14
CY, 14
CZ, 15
DK, 13
EE, 13
ES, 14
FI, 13
FR, 15
GB, 13
GR, 15
IT, 14
LT, 14
LV, 13
MT, 13
NO, 13
PT, 13
SE, 13
US, 13";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigitalConsent {
    default_age: u8,
    countries: HashMap<String, u8>,
}

impl DigitalConsent {
    /// Parse one `COUNTRY, AGE` pair per line; a `*` line is mandatory.
    ///
    /// # Errors
    /// Returns an error for malformed lines, invalid ages, or a missing `*` entry.
    pub fn parse(map: &str) -> Result<Self> {
        let mut default_age = None;
        let mut countries = HashMap::new();

        for (index, line) in map.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (country, age) = line
                .split_once(',')
                .ok_or_else(|| anyhow!("line {}: expected `COUNTRY, AGE`", index + 1))?;
            let country = country.trim().to_uppercase();
            let age: u8 = age
                .trim()
                .parse()
                .with_context(|| format!("line {}: invalid age", index + 1))?;

            if country == DEFAULT_COUNTRY_KEY {
                default_age = Some(age);
            } else if country.len() == 2 && country.chars().all(|c| c.is_ascii_alphabetic()) {
                countries.insert(country, age);
            } else {
                return Err(anyhow!(
                    "line {}: invalid country code {country}",
                    index + 1
                ));
            }
        }

        let default_age =
            default_age.ok_or_else(|| anyhow!("age of consent map requires a `*` entry"))?;

        Ok(Self {
            default_age,
            countries,
        })
    }

    #[must_use]
    pub fn consent_age(&self, country: &str) -> u8 {
        self.countries
            .get(&country.trim().to_uppercase())
            .copied()
            .unwrap_or(self.default_age)
    }

    #[must_use]
    pub fn is_minor(&self, age: u8, country: &str) -> bool {
        age < self.consent_age(country)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinorStatus {
    Unverified,
    Minor,
    Adult,
}

impl MinorStatus {
    #[must_use]
    pub fn from_cache(value: Option<&str>) -> Self {
        match value {
            None => Self::Unverified,
            Some("yes") => Self::Minor,
            Some(_) => Self::Adult,
        }
    }

    #[must_use]
    pub const fn cache_value(is_minor: bool) -> &'static str {
        if is_minor { "yes" } else { "no" }
    }
}

/// Short-lived, per-session key/value cache used before an account exists.
#[async_trait]
pub trait PresignupCache: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Option<String>;
    async fn set(&self, session_id: &str, key: &str, value: String);
}

struct CacheEntry {
    value: String,
    stored_at: Instant,
}

pub struct MemoryPresignupCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl MemoryPresignupCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PresignupCache for MemoryPresignupCache {
    async fn get(&self, session_id: &str, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        entries
            .get(&(session_id.to_string(), key.to_string()))
            .map(|entry| entry.value.clone())
    }

    async fn set(&self, session_id: &str, key: &str, value: String) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        entries.insert(
            (session_id.to_string(), key.to_string()),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }
}

pub(super) async fn minor_status(cache: &dyn PresignupCache, session_id: &str) -> MinorStatus {
    MinorStatus::from_cache(cache.get(session_id, IS_MINOR_KEY).await.as_deref())
}

/// Where the consent gate sends the visitor, if anywhere.
pub(super) async fn gate(state: &SignupState, session: &Session) -> Option<Outcome> {
    state.config().digital_consent()?;
    match minor_status(state.presignup(), session.id()).await {
        MinorStatus::Unverified => Some(Outcome::Redirect(
            state.config().verify_age_location_url(),
        )),
        MinorStatus::Minor => Some(Outcome::Redirect(state.config().digital_minor_url())),
        MinorStatus::Adult => None,
    }
}

fn age_location_form(config: &SiteConfig) -> serde_json::Value {
    json!({
        "action": config.verify_age_location_url(),
        "fields": [
            {"name": "age", "label": "Age", "type": "number", "required": true},
            {"name": "country", "label": "Country of residence", "type": "country", "required": true},
        ],
    })
}

fn age_location_page(config: &SiteConfig, errors: Vec<FieldError>) -> Page {
    Page::VerifyAgeLocation {
        title: strings::AGE_LOCATION_TITLE.to_string(),
        form: age_location_form(config),
        errors,
    }
}

fn consent_disabled() -> axum::response::Response {
    respond(
        Outcome::Page(
            StatusCode::NOT_FOUND,
            Page::error(strings::CONSENT_DISABLED),
        ),
        None,
    )
}

const MAX_AGE: i64 = 150;

/// Stated age when it is within `0..=MAX_AGE`.
fn plausible_age(age: Option<i64>) -> Option<u8> {
    age.filter(|age| (0..=MAX_AGE).contains(age))
        .and_then(|age| u8::try_from(age).ok())
}

fn validate_age_location(submission: &AgeLocationSubmission) -> Vec<FieldError> {
    let mut errors = Vec::new();
    match submission.age {
        None => errors.push(FieldError::new("age", strings::REQUIRED)),
        Some(_) if plausible_age(submission.age).is_none() => {
            errors.push(FieldError::new("age", strings::INVALID_AGE));
        }
        Some(_) => {}
    }
    let country = submission.country.trim();
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        errors.push(FieldError::new("country", strings::REQUIRED));
    }
    errors
}

#[utoipa::path(
    get,
    path = "/v1/login/verify-age-location",
    responses(
        (status = 200, description = "Age and location form", body = Page),
        (status = 404, description = "Verification disabled", body = Page)
    ),
    tag = "signup"
)]
pub async fn verify_age_location_form(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
) -> impl IntoResponse {
    if state.config().digital_consent().is_none() {
        return consent_disabled();
    }
    let session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    session.commit(state.sessions()).await;
    respond(
        Outcome::Page(StatusCode::OK, age_location_page(state.config(), Vec::new())),
        session.cookie(state.config()),
    )
}

#[utoipa::path(
    post,
    path = "/v1/login/verify-age-location",
    request_body = AgeLocationSubmission,
    responses(
        (status = 303, description = "Redirect to signup or digital minor page"),
        (status = 400, description = "Missing payload", body = String),
        (status = 404, description = "Verification disabled", body = Page),
        (status = 422, description = "Validation error", body = Page)
    ),
    tag = "signup"
)]
pub async fn verify_age_location(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
    payload: Option<Json<AgeLocationSubmission>>,
) -> impl IntoResponse {
    let Some(consent) = state.config().digital_consent() else {
        return consent_disabled();
    };
    let submission: AgeLocationSubmission = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };
    let session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    session.commit(state.sessions()).await;
    let cookie = session.cookie(state.config());

    let errors = validate_age_location(&submission);
    let Some(age) = plausible_age(submission.age).filter(|_| errors.is_empty()) else {
        return respond(
            Outcome::Page(
                StatusCode::UNPROCESSABLE_ENTITY,
                age_location_page(state.config(), errors),
            ),
            cookie,
        );
    };

    let is_minor = consent.is_minor(age, &submission.country);
    debug!(country = %submission.country, is_minor, "age and location verified");
    state
        .presignup()
        .set(
            session.id(),
            IS_MINOR_KEY,
            MinorStatus::cache_value(is_minor).to_string(),
        )
        .await;

    let target = if is_minor {
        state.config().digital_minor_url()
    } else {
        state.config().signup_url()
    };
    respond(Outcome::Redirect(target), cookie)
}

#[utoipa::path(
    get,
    path = "/v1/login/digital-minor",
    responses(
        (status = 200, description = "Digital minor notice", body = Page),
        (status = 404, description = "Verification disabled", body = Page)
    ),
    tag = "signup"
)]
pub async fn digital_minor(state: Extension<Arc<SignupState>>) -> impl IntoResponse {
    if state.config().digital_consent().is_none() {
        return consent_disabled();
    }
    let support_email = state.config().support_email().map(ToString::to_string);
    respond(
        Outcome::Page(
            StatusCode::OK,
            Page::DigitalMinor {
                title: strings::DIGITAL_MINOR_TITLE.to_string(),
                message: strings::digital_minor(support_email.as_deref()),
                support_email,
            },
        ),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_parses() -> Result<()> {
        let consent = DigitalConsent::parse(DEFAULT_AGE_OF_CONSENT_MAP)?;
        assert_eq!(consent.consent_age("AT"), 14);
        assert_eq!(consent.consent_age("us"), 13);
        assert_eq!(consent.consent_age("AU"), 16);
        Ok(())
    }

    #[test]
    fn is_minor_compares_against_country_age() -> Result<()> {
        let consent = DigitalConsent::parse("*, 16\nAT, 14")?;
        assert!(consent.is_minor(13, "AT"));
        assert!(!consent.is_minor(14, "AT"));
        assert!(consent.is_minor(15, "NZ"));
        assert!(!consent.is_minor(16, "NZ"));
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_maps() {
        assert!(DigitalConsent::parse("AT, 14").is_err());
        assert!(DigitalConsent::parse("*, 16\nAT 14").is_err());
        assert!(DigitalConsent::parse("*, sixteen").is_err());
        assert!(DigitalConsent::parse("*, 16\nAUT, 14").is_err());
    }

    #[test]
    fn minor_status_from_cache_values() {
        assert_eq!(MinorStatus::from_cache(None), MinorStatus::Unverified);
        assert_eq!(MinorStatus::from_cache(Some("yes")), MinorStatus::Minor);
        assert_eq!(MinorStatus::from_cache(Some("no")), MinorStatus::Adult);
        assert_eq!(MinorStatus::cache_value(true), "yes");
        assert_eq!(MinorStatus::cache_value(false), "no");
    }

    #[test]
    fn validate_age_location_requires_both_fields() {
        let errors = validate_age_location(&AgeLocationSubmission {
            age: None,
            country: "Austria".to_string(),
        });
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["age", "country"]);

        let errors = validate_age_location(&AgeLocationSubmission {
            age: Some(30),
            country: "at".to_string(),
        });
        assert!(errors.is_empty());
    }

    #[test]
    fn validate_age_location_rejects_out_of_range_ages() {
        for age in [-1, 151, 300] {
            let errors = validate_age_location(&AgeLocationSubmission {
                age: Some(age),
                country: "AT".to_string(),
            });
            assert_eq!(errors, vec![FieldError::new("age", strings::INVALID_AGE)], "{age}");
        }
        assert_eq!(plausible_age(Some(0)), Some(0));
        assert_eq!(plausible_age(Some(150)), Some(150));
    }

    #[tokio::test]
    async fn presignup_cache_is_scoped_by_session() {
        let cache = MemoryPresignupCache::new(Duration::from_secs(60));
        cache.set("one", IS_MINOR_KEY, "yes".to_string()).await;
        assert_eq!(minor_status(&cache, "one").await, MinorStatus::Minor);
        assert_eq!(minor_status(&cache, "two").await, MinorStatus::Unverified);
    }

    #[tokio::test]
    async fn presignup_cache_entries_expire() {
        let cache = MemoryPresignupCache::new(Duration::from_millis(10));
        cache.set("one", IS_MINOR_KEY, "no".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(minor_status(&cache, "one").await, MinorStatus::Unverified);
    }
}
