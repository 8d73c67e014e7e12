//! Signup handlers and supporting modules.
//!
//! The signup page runs a fixed sequence of gates before showing or
//! processing the form: self registration must be enabled, the visitor must
//! not already be logged in, the digital consent check (when enabled) must
//! have passed, and pre-signup hooks may redirect first.
//!
//! ## Enrolment tokens
//!
//! When an `EnrolmentTokenPlugin` is installed the form gains a `token` field
//! and a non-empty token is redeemed right after the account is created.
//! Redemption problems (unknown, expired, no seats left) are logged and the
//! signup still succeeds. Without the plugin the standard flow runs.
//!
//! ## Confirmation
//!
//! New accounts are unconfirmed. The confirmation email is queued in
//! `email_outbox`; following its link confirms the account, logs the user in
//! and returns them to the page they originally wanted.

pub(crate) mod account;
pub(crate) mod auth_plugin;
pub(crate) mod consent;
mod controller;
pub(crate) mod enrol;
pub(crate) mod events;
pub(crate) mod hooks;
pub(crate) mod mailer;
pub(crate) mod page;
pub(crate) mod render;
pub(crate) mod session;
mod state;
mod storage;
mod strings;
pub(crate) mod types;
mod utils;

pub use auth_plugin::PasswordPolicy;
pub use consent::{DigitalConsent, MemoryPresignupCache};
pub use enrol::PgTokenEnrolment;
pub use events::{BroadcastEventBus, spawn_event_logger};
pub use hooks::PolicyAgreementHook;
pub use mailer::OutboxMailer;
pub use session::MemorySessionStore;
pub use state::{ProfileFieldDef, SignupState, SiteConfig};
pub use storage::PgUserRepository;

#[cfg(test)]
mod test_support;
