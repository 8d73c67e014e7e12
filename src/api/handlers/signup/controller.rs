//! Signup page flow shared by the GET and POST handlers.
//!
//! Both requests run the same gates (`prepare`) before the form is drawn or
//! the submission is processed. Account creation follows in
//! `user_signup_with_confirmation`: store the user, redeem the enrolment
//! token when the token plugin is installed, then queue the confirmation
//! email.

use anyhow::Result;
use axum::http::StatusCode;
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    auth_plugin::AuthPlugin,
    consent,
    enrol::EnrolmentOutcome,
    events::SignupEvent,
    hooks::{HookContext, PreSignup, run_post_signup, run_pre_signup, run_validate},
    mailer::ConfirmationEmail,
    session::Session,
    state::{SignupState, SiteConfig},
    storage::{CreateOutcome, NewUser, WANTSURL_PREFERENCE},
    strings,
    types::{Button, FieldError, Outcome, Page, SignupSubmission},
    utils::{
        build_confirmation_link, generate_secret, hash_password, normalize_email,
        normalize_wants_url,
    },
};

/// Result of the gates every signup request passes.
pub(super) enum Prepared {
    Ready(Arc<dyn AuthPlugin>),
    Done(Outcome),
}

enum Created {
    Done(Outcome),
    UsernameTaken,
}

pub(super) async fn prepare(state: &SignupState, session: &mut Session) -> Result<Prepared> {
    let config = state.config();

    let Some(plugin) = state.plugins().signup_plugin(config.register_auth()) else {
        return Ok(Prepared::Done(Outcome::Page(
            StatusCode::FORBIDDEN,
            Page::error(strings::SIGNUP_DISABLED),
        )));
    };

    session.data.wants_url = Some(normalize_wants_url(
        session.data.wants_url.as_deref(),
        &config.signup_url(),
        &config.site_root_url(),
    ));

    if session.data.is_logged_in_user() {
        return Ok(Prepared::Done(cannot_signup(config, session)));
    }

    if let Some(outcome) = consent::gate(state, session).await {
        return Ok(Prepared::Done(outcome));
    }

    let ctx = HookContext {
        config,
        session: &session.data,
    };
    if let PreSignup::Redirect(url) = run_pre_signup(state.hooks(), &ctx).await? {
        return Ok(Prepared::Done(Outcome::Redirect(url)));
    }

    Ok(Prepared::Ready(plugin))
}

fn cannot_signup(config: &SiteConfig, session: &Session) -> Outcome {
    let fullname = session
        .data
        .user
        .as_ref()
        .map(|user| user.fullname.clone())
        .unwrap_or_default();

    let mut params = BTreeMap::new();
    params.insert("sesskey".to_string(), session.data.sesskey.clone());
    params.insert("loginpage".to_string(), "1".to_string());

    Outcome::Page(
        StatusCode::CONFLICT,
        Page::CannotSignup {
            message: strings::cannot_signup(&fullname),
            logout: Button {
                label: strings::LOGOUT.to_string(),
                url: config.logout_url(),
                method: "post".to_string(),
                params,
            },
            cancel: Button {
                label: strings::CANCEL.to_string(),
                url: config.site_root_url(),
                method: "get".to_string(),
                params: BTreeMap::new(),
            },
        },
    )
}

/// Signup page with the plugin's form, prefilled from `defaults`.
pub(super) fn show_form(
    state: &SignupState,
    plugin: &dyn AuthPlugin,
    defaults: &SignupSubmission,
    status: StatusCode,
    errors: Vec<FieldError>,
) -> Outcome {
    let config = state.config();
    let form = plugin.signup_form(config, state.enrolment().is_some(), defaults);
    let form = state.renderers().render_form(&form);

    Outcome::Page(
        status,
        Page::SignupForm {
            title: strings::NEW_ACCOUNT.to_string(),
            heading: config.site_fullname().to_string(),
            navbar: vec![strings::LOGIN.to_string(), strings::NEW_ACCOUNT.to_string()],
            form,
            errors,
        },
    )
}

pub(super) async fn submit(
    state: &SignupState,
    plugin: &dyn AuthPlugin,
    session: &Session,
    submission: SignupSubmission,
) -> Result<Outcome> {
    let config = state.config();

    if submission.cancel {
        return Ok(Outcome::Redirect(config.login_url()));
    }

    let mut errors = plugin
        .validate(&submission, state.users(), config)
        .await?;
    errors.extend(run_validate(state.hooks(), &submission));
    if !errors.is_empty() {
        debug!(errors = errors.len(), "signup submission rejected");
        let defaults = without_password(submission);
        return Ok(show_form(
            state,
            plugin,
            &defaults,
            StatusCode::UNPROCESSABLE_ENTITY,
            errors,
        ));
    }

    let mut user = signup_setup_new_user(
        config,
        plugin.authtype(),
        &submission,
        state.enrolment().is_some(),
    );
    run_post_signup(state.hooks(), &mut user).await?;

    match user_signup_with_confirmation(
        state,
        user,
        session.data.wants_url.as_deref(),
        config.notify_on_signup(),
    )
    .await?
    {
        Created::Done(outcome) => Ok(outcome),
        Created::UsernameTaken => Ok(show_form(
            state,
            plugin,
            &without_password(submission),
            StatusCode::UNPROCESSABLE_ENTITY,
            vec![FieldError::new("username", strings::USERNAME_EXISTS)],
        )),
    }
}

fn without_password(submission: SignupSubmission) -> SignupSubmission {
    SignupSubmission {
        password: String::new(),
        ..submission
    }
}

/// Fill in the account defaults for a validated submission.
pub(super) fn signup_setup_new_user(
    config: &SiteConfig,
    authtype: &str,
    submission: &SignupSubmission,
    with_token: bool,
) -> NewUser {
    let profile_fields = config
        .profile_fields()
        .iter()
        .filter_map(|field| {
            submission
                .profile_fields
                .get(&field.shortname)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(|value| (field.shortname.clone(), value.to_string()))
        })
        .collect();

    let token = if with_token {
        submission
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToString::to_string)
    } else {
        None
    };

    NewUser {
        username: submission.username.trim().to_lowercase(),
        password: submission.password.clone().into(),
        email: normalize_email(&submission.email),
        firstname: submission.firstname.trim().to_string(),
        lastname: submission.lastname.trim().to_string(),
        city: submission.city.trim().to_string(),
        country: submission.country.trim().to_uppercase(),
        auth: authtype.to_string(),
        lang: config.default_lang().to_string(),
        calendar_type: None,
        confirmed: false,
        first_access: 0,
        time_created: unix_now(),
        secret: generate_secret(),
        policy_agreed: false,
        token,
        profile_fields,
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

async fn user_signup_with_confirmation(
    state: &SignupState,
    mut user: NewUser,
    wants_url: Option<&str>,
    notify: bool,
) -> Result<Created> {
    let config = state.config();
    let users = state.users();

    let password_hash = hash_password(user.password.expose_secret())?;
    if user.calendar_type.is_none() {
        user.calendar_type = Some(config.default_calendar_type().to_string());
    }

    let user_id = match users.create_user(&user, &password_hash).await? {
        CreateOutcome::Created(user_id) => user_id,
        CreateOutcome::Conflict => {
            warn!(username = %user.username, "username taken during signup");
            return Ok(Created::UsernameTaken);
        }
    };
    info!(user_id = %user_id, username = %user.username, "user created");

    if config.password_reuse_limit() > 0 {
        users
            .add_password_history(user_id, &password_hash, config.password_reuse_limit())
            .await?;
    }

    if !user.profile_fields.is_empty() {
        users.save_profile_fields(user_id, &user.profile_fields).await?;
    }

    if let Some(wants_url) = wants_url {
        users
            .set_preference(user_id, WANTSURL_PREFERENCE, wants_url)
            .await?;
    }

    state
        .events()
        .publish(SignupEvent::UserCreated { user_id })
        .await;

    redeem_token(state, user_id, &user).await?;

    if let Err(err) = send_confirmation(config, state, &user).await {
        error!(user_id = %user_id, "Failed to send confirmation email: {err}");
        return Ok(Created::Done(Outcome::Page(
            StatusCode::INTERNAL_SERVER_ERROR,
            Page::error(strings::EMAIL_NOT_SENT),
        )));
    }

    if !notify {
        return Ok(Created::Done(Outcome::Page(
            StatusCode::CREATED,
            Page::Created {
                user_id: user_id.to_string(),
            },
        )));
    }

    Ok(Created::Done(Outcome::Page(
        StatusCode::CREATED,
        Page::Notice {
            title: strings::EMAIL_CONFIRM.to_string(),
            heading: config.site_fullname().to_string(),
            navbar: vec![strings::EMAIL_CONFIRM.to_string()],
            message: strings::email_confirm_sent(&user.email),
            continue_url: config.index_url(),
        },
    )))
}

/// Redeem the submitted token when the token plugin is installed.
async fn redeem_token(state: &SignupState, user_id: Uuid, user: &NewUser) -> Result<()> {
    let (Some(plugin), Some(token)) = (state.enrolment(), user.token.as_deref()) else {
        return Ok(());
    };

    match plugin.perform_trusted_enrolment(token, user_id, user).await? {
        EnrolmentOutcome::Enrolled { course_id } => {
            info!(user_id = %user_id, course_id, "enrolment token redeemed");
            state
                .events()
                .publish(SignupEvent::TokenRedeemed { user_id, course_id })
                .await;
        }
        outcome => {
            warn!(user_id = %user_id, ?outcome, "enrolment token not redeemed");
        }
    }
    Ok(())
}

async fn send_confirmation(config: &SiteConfig, state: &SignupState, user: &NewUser) -> Result<()> {
    let base = config
        .confirmation_url()
        .map_or_else(|| config.confirm_url(), ToString::to_string);
    let confirm_link = build_confirmation_link(&base, &user.secret, &user.username)?;
    let email = ConfirmationEmail {
        username: user.username.clone(),
        firstname: user.firstname.clone(),
        lastname: user.lastname.clone(),
        email: user.email.clone(),
        confirm_link,
        site_fullname: config.site_fullname().to_string(),
    };
    state.mailer().send_confirmation(&email).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::signup::state::ProfileFieldDef;
    use secrecy::ExposeSecret;

    #[test]
    fn setup_new_user_applies_defaults() {
        let config = SiteConfig::new("https://learn.example.com", "Example".to_string())
            .with_default_lang("es".to_string())
            .with_profile_fields(vec![ProfileFieldDef {
                shortname: "employer".to_string(),
                name: "Employer".to_string(),
                required: false,
            }]);
        let mut profile_fields = BTreeMap::new();
        profile_fields.insert("employer".to_string(), " Acme ".to_string());
        profile_fields.insert("unknown".to_string(), "ignored".to_string());
        let submission = SignupSubmission {
            username: " Alice ".to_string(),
            password: "Sup3r$ecret".to_string(),
            email: "Alice@Example.com".to_string(),
            firstname: "Alice".to_string(),
            lastname: "Liddell".to_string(),
            country: "gb".to_string(),
            token: Some("  COURSE-1 ".to_string()),
            profile_fields,
            ..SignupSubmission::default()
        };

        let user = signup_setup_new_user(&config, "email", &submission, true);
        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.auth, "email");
        assert_eq!(user.lang, "es");
        assert_eq!(user.country, "GB");
        assert!(!user.confirmed);
        assert_eq!(user.first_access, 0);
        assert!(user.time_created > 0);
        assert_eq!(user.secret.len(), 15);
        assert_eq!(user.password.expose_secret(), "Sup3r$ecret");
        assert_eq!(user.token.as_deref(), Some("COURSE-1"));
        assert_eq!(
            user.profile_fields.get("employer").map(String::as_str),
            Some("Acme")
        );
        assert!(!user.profile_fields.contains_key("unknown"));

        let user = signup_setup_new_user(&config, "email", &submission, false);
        assert_eq!(user.token, None);
    }

    #[test]
    fn setup_new_user_drops_blank_token() {
        let config = SiteConfig::new("https://learn.example.com", "Example".to_string());
        let submission = SignupSubmission {
            token: Some("   ".to_string()),
            ..SignupSubmission::default()
        };
        let user = signup_setup_new_user(&config, "email", &submission, true);
        assert_eq!(user.token, None);
    }
}
