//! # Enrolgate (self-service signup with enrolment tokens)
//!
//! `enrolgate` serves the account-creation flow of a learning site: it renders
//! the signup form, validates submissions, creates unconfirmed local accounts,
//! optionally redeems an enrolment token, and queues the confirmation email.
//!
//! ## Flow
//!
//! Every signup request passes the same gates before the form is touched:
//!
//! - **Signup enabled:** an auth plugin must be configured for self-registration.
//! - **Return-to URL:** `?wantsurl=` on the signup page sets the session's
//!   `wants_url`. It is reset to the site root when empty, off-site, or pointing
//!   back at the signup page.
//! - **Already signed in:** logged-in, non-guest visitors get a "cannot sign up"
//!   page with log out / cancel actions.
//! - **Digital consent:** when enabled, visitors must pass the age/location check;
//!   the result lives in a short-lived per-session cache.
//! - **Pre-signup hooks:** plugins (e.g. policy acceptance) may redirect first.
//!
//! ## Enrolment tokens
//!
//! When the token plugin is configured the form gains an optional `token` field.
//! A non-empty token is redeemed right after the account is created. Without the
//! plugin the standard signup flow runs unchanged.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
