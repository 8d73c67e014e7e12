//! Account confirmation and logout.

use anyhow::Result;
use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{error, info};

use super::{
    events::SignupEvent,
    session::{Session, SessionUser},
    state::SignupState,
    storage::WANTSURL_PREFERENCE,
    strings,
    types::{ConfirmQuery, LogoutQuery, Outcome, Page, respond},
    utils::{is_on_site_url, parse_confirmation_data},
};

fn invalid_confirmation() -> Outcome {
    Outcome::Page(
        StatusCode::BAD_REQUEST,
        Page::error(strings::INVALID_CONFIRMATION),
    )
}

async fn confirm_account(
    state: &SignupState,
    session: &mut Session,
    data: Option<&str>,
) -> Result<Outcome> {
    let Some((secret, username)) = data.and_then(parse_confirmation_data) else {
        return Ok(invalid_confirmation());
    };

    let record = match state.users().find_for_confirmation(username).await? {
        Some(record) if record.secret == secret => record,
        _ => return Ok(invalid_confirmation()),
    };

    if record.confirmed {
        return Ok(Outcome::Page(
            StatusCode::OK,
            Page::AlreadyConfirmed {
                message: strings::ALREADY_CONFIRMED.to_string(),
                continue_url: state.config().index_url(),
            },
        ));
    }

    state.users().confirm_user(record.user_id).await?;
    info!(user_id = %record.user_id, "account confirmed");
    state
        .events()
        .publish(SignupEvent::UserConfirmed {
            user_id: record.user_id,
        })
        .await;

    session.data.user = Some(SessionUser {
        user_id: record.user_id,
        username: record.username,
        fullname: format!("{} {}", record.firstname, record.lastname)
            .trim()
            .to_string(),
        is_guest: false,
    });

    let target = state
        .users()
        .take_preference(record.user_id, WANTSURL_PREFERENCE)
        .await?
        .filter(|url| is_on_site_url(url, &state.config().site_root_url()))
        .unwrap_or_else(|| state.config().site_root_url());
    Ok(Outcome::Redirect(target))
}

#[utoipa::path(
    get,
    path = "/v1/login/confirm",
    params(ConfirmQuery),
    responses(
        (status = 200, description = "Account already confirmed", body = Page),
        (status = 303, description = "Confirmed and logged in"),
        (status = 400, description = "Invalid confirmation data", body = Page)
    ),
    tag = "signup"
)]
pub async fn confirm(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
    query: Query<ConfirmQuery>,
) -> impl IntoResponse {
    let mut session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match confirm_account(&state, &mut session, query.0.data.as_deref()).await {
        Ok(outcome) => {
            session.commit(state.sessions()).await;
            respond(outcome, session.cookie(state.config()))
        }
        Err(err) => {
            error!("Failed to confirm account: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/login/logout",
    params(LogoutQuery),
    responses(
        (status = 303, description = "Logged out"),
        (status = 400, description = "Wrong sesskey", body = Page)
    ),
    tag = "signup"
)]
pub async fn logout(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
    query: Query<LogoutQuery>,
) -> impl IntoResponse {
    let session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if query.sesskey.as_deref() != Some(session.data.sesskey.as_str()) {
        return respond(
            Outcome::Page(StatusCode::BAD_REQUEST, Page::error(strings::INVALID_SESSKEY)),
            None,
        );
    }

    if let Some(user) = &session.data.user {
        info!(user_id = %user.user_id, "user logged out");
    }
    state.sessions().remove(session.id()).await;

    let target = if query.loginpage == Some(1) {
        state.config().login_url()
    } else {
        state.config().site_root_url()
    };
    respond(Outcome::Redirect(target), None)
}
