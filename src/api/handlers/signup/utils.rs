//! Small helpers for signup validation, secrets, and URLs.

use anyhow::{Result, anyhow};
use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use rand::{Rng, distributions::Alphanumeric};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

const SECRET_LENGTH: usize = 15;

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());
static USERNAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.@-]+$").ok());

/// Normalize an email for lookup/uniqueness checks.
pub(super) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(super) fn valid_email(email_normalized: &str) -> bool {
    EMAIL_RE
        .as_ref()
        .is_some_and(|regex| regex.is_match(email_normalized))
}

/// Usernames are lowercase letters, digits, and `_ - . @`.
pub(super) fn valid_username(username: &str) -> bool {
    USERNAME_RE
        .as_ref()
        .is_some_and(|regex| regex.is_match(username))
}

/// Domain allow/deny check. Entries starting with `.` also match subdomains.
pub(super) fn email_domain_matches(email: &str, pattern: &str) -> bool {
    if pattern.starts_with('.') {
        email.ends_with(pattern)
    } else {
        email.ends_with(&format!("@{pattern}"))
    }
}

/// Random secret embedded in the confirmation link.
pub(super) fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}

/// Hash a password with Argon2id and a random salt.
pub(super) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| anyhow!("failed to hash password"))
}

/// Compare URLs ignoring query and fragment.
pub(super) fn same_base_url(left: &Url, right: &Url) -> bool {
    left.scheme() == right.scheme()
        && left.host_str() == right.host_str()
        && left.port_or_known_default() == right.port_or_known_default()
        && left.path().trim_end_matches('/') == right.path().trim_end_matches('/')
}

/// Same scheme, host and port as the site root.
fn on_site(url: &Url, site_root: &Url) -> bool {
    url.scheme() == site_root.scheme()
        && url.host_str() == site_root.host_str()
        && url.port_or_known_default() == site_root.port_or_known_default()
}

/// `true` when `url` parses and points at the site rooted at `site_root`.
pub(super) fn is_on_site_url(url: &str, site_root: &str) -> bool {
    match (Url::parse(url.trim()), Url::parse(site_root)) {
        (Ok(url), Ok(root)) => on_site(&url, &root),
        _ => false,
    }
}

/// Keep the return-to URL unless it is empty, unparseable, off-site, or the
/// signup page itself; otherwise fall back to the site root.
pub(super) fn normalize_wants_url(
    wants_url: Option<&str>,
    signup_url: &str,
    site_root: &str,
) -> String {
    let Some(wants_url) = wants_url.map(str::trim).filter(|url| !url.is_empty()) else {
        return site_root.to_string();
    };
    match (Url::parse(wants_url), Url::parse(signup_url), Url::parse(site_root)) {
        (Ok(wanted), Ok(signup), Ok(root))
            if on_site(&wanted, &root) && !same_base_url(&wanted, &signup) =>
        {
            wants_url.to_string()
        }
        _ => site_root.to_string(),
    }
}

/// Build the confirmation link: `{base}?data={secret}/{username}`.
pub(super) fn build_confirmation_link(base: &str, secret: &str, username: &str) -> Result<String> {
    let mut url = Url::parse(base).map_err(|err| anyhow!("invalid confirmation URL {base}: {err}"))?;
    url.query_pairs_mut()
        .append_pair("data", &format!("{secret}/{username}"));
    Ok(url.to_string())
}

/// Split `{secret}/{username}` from a confirmation link.
pub(super) fn parse_confirmation_data(data: &str) -> Option<(&str, &str)> {
    let (secret, username) = data.trim().split_once('/')?;
    if secret.is_empty() || username.is_empty() {
        return None;
    }
    Some((secret, username))
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}
