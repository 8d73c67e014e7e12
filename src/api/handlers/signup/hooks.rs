//! Pre/post signup extension points.
//!
//! Hooks run in registration order. `pre_signup` may send the visitor away
//! before the form is shown (e.g. to accept the site policy), `validate` adds
//! field errors to a submission, and `post_signup` adjusts the new account
//! before it is stored.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, error};

use super::{
    session::{Session, SessionData},
    state::{SignupState, SiteConfig},
    storage::NewUser,
    strings,
    types::{FieldError, Outcome, Page, SignupSubmission, respond},
};

pub struct HookContext<'a> {
    pub config: &'a SiteConfig,
    pub session: &'a SessionData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreSignup {
    Continue,
    Redirect(String),
}

#[async_trait]
pub trait SignupHook: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_signup(&self, _ctx: &HookContext<'_>) -> Result<PreSignup> {
        Ok(PreSignup::Continue)
    }

    fn validate(&self, _submission: &SignupSubmission) -> Vec<FieldError> {
        Vec::new()
    }

    async fn post_signup(&self, _user: &mut NewUser) -> Result<()> {
        Ok(())
    }
}

/// Run pre-signup hooks until one redirects.
pub(super) async fn run_pre_signup(
    hooks: &[Arc<dyn SignupHook>],
    ctx: &HookContext<'_>,
) -> Result<PreSignup> {
    for hook in hooks {
        if let PreSignup::Redirect(url) = hook.pre_signup(ctx).await? {
            debug!(hook = hook.name(), url = %url, "pre-signup hook redirected");
            return Ok(PreSignup::Redirect(url));
        }
    }
    Ok(PreSignup::Continue)
}

pub(super) fn run_validate(
    hooks: &[Arc<dyn SignupHook>],
    submission: &SignupSubmission,
) -> Vec<FieldError> {
    hooks
        .iter()
        .flat_map(|hook| hook.validate(submission))
        .collect()
}

pub(super) async fn run_post_signup(hooks: &[Arc<dyn SignupHook>], user: &mut NewUser) -> Result<()> {
    for hook in hooks {
        hook.post_signup(user).await?;
    }
    Ok(())
}

/// Requires the site policy to be accepted in the session before signing up.
/// Does nothing while no policy URL is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyAgreementHook;

#[async_trait]
impl SignupHook for PolicyAgreementHook {
    fn name(&self) -> &str {
        "policy_agreement"
    }

    async fn pre_signup(&self, ctx: &HookContext<'_>) -> Result<PreSignup> {
        match ctx.config.policy_url() {
            Some(url) if !ctx.session.policy_agreed => Ok(PreSignup::Redirect(url.to_string())),
            _ => Ok(PreSignup::Continue),
        }
    }

    async fn post_signup(&self, user: &mut NewUser) -> Result<()> {
        user.policy_agreed = true;
        Ok(())
    }
}

/// Record policy acceptance in the session and return to the signup page.
#[utoipa::path(
    post,
    path = "/v1/login/policy/accept",
    responses(
        (status = 303, description = "Policy accepted, back to signup"),
        (status = 404, description = "No site policy configured", body = Page)
    ),
    tag = "signup"
)]
pub async fn accept_policy(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
) -> impl IntoResponse {
    if state.config().policy_url().is_none() {
        return respond(
            Outcome::Page(StatusCode::NOT_FOUND, Page::error(strings::POLICY_DISABLED)),
            None,
        );
    }
    let mut session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    session.data.policy_agreed = true;
    session.commit(state.sessions()).await;
    respond(
        Outcome::Redirect(state.config().signup_url()),
        session.cookie(state.config()),
    )
}
