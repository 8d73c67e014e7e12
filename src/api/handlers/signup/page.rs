use axum::{
    Json,
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::error;

use super::{
    controller::{Prepared, prepare, show_form, submit},
    session::Session,
    state::SignupState,
    types::{Outcome, Page, SignupQuery, SignupSubmission, respond},
};

#[utoipa::path(
    get,
    path = "/v1/login/signup",
    params(SignupQuery),
    responses(
        (status = 200, description = "Signup form", body = Page),
        (status = 303, description = "Redirect to consent, policy or another gate"),
        (status = 403, description = "Self registration disabled", body = Page),
        (status = 409, description = "Already logged in", body = Page)
    ),
    tag = "signup"
)]
pub async fn signup_form(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
    query: Query<SignupQuery>,
) -> impl IntoResponse {
    let mut session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let SignupQuery { token, wantsurl } = query.0;
    if wantsurl.is_some() {
        session.data.wants_url = wantsurl;
    }

    let outcome = match prepare(&state, &mut session).await {
        Ok(Prepared::Ready(plugin)) => {
            let defaults = SignupSubmission {
                token,
                ..SignupSubmission::default()
            };
            show_form(&state, plugin.as_ref(), &defaults, StatusCode::OK, Vec::new())
        }
        Ok(Prepared::Done(outcome)) => outcome,
        Err(err) => {
            error!("Signup gate failed: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    session.commit(state.sessions()).await;
    respond(outcome, session.cookie(state.config()))
}

#[utoipa::path(
    post,
    path = "/v1/login/signup",
    request_body = SignupSubmission,
    responses(
        (status = 201, description = "Account created, confirmation email queued", body = Page),
        (status = 303, description = "Cancelled or sent to another gate"),
        (status = 400, description = "Missing payload", body = String),
        (status = 403, description = "Self registration disabled", body = Page),
        (status = 409, description = "Already logged in", body = Page),
        (status = 422, description = "Validation errors", body = Page),
        (status = 500, description = "Confirmation email could not be sent", body = Page)
    ),
    tag = "signup"
)]
pub async fn signup_submit(
    headers: HeaderMap,
    state: Extension<Arc<SignupState>>,
    payload: Option<Json<SignupSubmission>>,
) -> impl IntoResponse {
    let submission: SignupSubmission = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let mut session = match Session::open(&headers, state.sessions()).await {
        Ok(session) => session,
        Err(err) => {
            error!("Failed to open session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let outcome: anyhow::Result<Outcome> = match prepare(&state, &mut session).await {
        Ok(Prepared::Ready(plugin)) => submit(&state, plugin.as_ref(), &session, submission).await,
        Ok(Prepared::Done(outcome)) => Ok(outcome),
        Err(err) => Err(err),
    };

    session.commit(state.sessions()).await;
    match outcome {
        Ok(outcome) => respond(outcome, session.cookie(state.config())),
        Err(err) => {
            error!("Signup failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
