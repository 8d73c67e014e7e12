//! Request/response types for signup endpoints.

use axum::{
    Json,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::error;
use utoipa::{IntoParams, ToSchema};

/// Submitted signup form.
#[derive(ToSchema, Serialize, Deserialize, Default, Clone)]
pub struct SignupSubmission {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email2: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    /// Enrolment token; ignored when the token plugin is not installed.
    #[serde(default)]
    pub token: Option<String>,
    /// Custom profile fields keyed by shortname.
    #[serde(default)]
    pub profile_fields: BTreeMap<String, String>,
    /// Set when the visitor pressed "Cancel".
    #[serde(default)]
    pub cancel: bool,
}

impl fmt::Debug for SignupSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignupSubmission")
            .field("username", &self.username)
            .field("password", &"***")
            .field("email", &self.email)
            .field("email2", &self.email2)
            .field("firstname", &self.firstname)
            .field("lastname", &self.lastname)
            .field("city", &self.city)
            .field("country", &self.country)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("profile_fields", &self.profile_fields)
            .field("cancel", &self.cancel)
            .finish()
    }
}

#[derive(Deserialize, IntoParams, Debug, Default)]
pub struct SignupQuery {
    /// Prefills the enrolment token field.
    pub token: Option<String>,
    /// On-site page to return to after confirmation.
    pub wantsurl: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct AgeLocationSubmission {
    pub age: Option<i64>,
    #[serde(default)]
    pub country: String,
}

#[derive(Deserialize, IntoParams, Debug, Default)]
pub struct ConfirmQuery {
    /// `{secret}/{username}` from the confirmation link.
    pub data: Option<String>,
}

#[derive(Deserialize, IntoParams, Debug, Default)]
pub struct LogoutQuery {
    pub sesskey: Option<String>,
    pub loginpage: Option<u8>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Single-action button rendered on a page.
#[derive(ToSchema, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub url: String,
    pub method: String,
    pub params: BTreeMap<String, String>,
}

/// Page model returned to the frontend, tagged by `page`.
#[derive(ToSchema, Serialize, Debug)]
#[serde(tag = "page", rename_all = "snake_case")]
pub enum Page {
    SignupForm {
        title: String,
        heading: String,
        navbar: Vec<String>,
        #[schema(value_type = Object)]
        form: serde_json::Value,
        errors: Vec<FieldError>,
    },
    CannotSignup {
        message: String,
        logout: Button,
        cancel: Button,
    },
    Notice {
        title: String,
        heading: String,
        navbar: Vec<String>,
        message: String,
        continue_url: String,
    },
    Created {
        user_id: String,
    },
    VerifyAgeLocation {
        title: String,
        #[schema(value_type = Object)]
        form: serde_json::Value,
        errors: Vec<FieldError>,
    },
    DigitalMinor {
        title: String,
        message: String,
        support_email: Option<String>,
    },
    AlreadyConfirmed {
        message: String,
        continue_url: String,
    },
    Error {
        message: String,
    },
}

impl Page {
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// What a signup step decided: draw a page or send the visitor elsewhere.
#[derive(Debug)]
pub enum Outcome {
    Page(StatusCode, Page),
    Redirect(String),
}

/// Turn an outcome into a response, attaching the session cookie if any.
pub(crate) fn respond(outcome: Outcome, cookie: Option<HeaderValue>) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = cookie {
        headers.insert(SET_COOKIE, cookie);
    }
    match outcome {
        Outcome::Page(status, page) => (status, headers, Json(page)).into_response(),
        Outcome::Redirect(location) => match HeaderValue::from_str(&location) {
            Ok(value) => {
                headers.insert(LOCATION, value);
                (StatusCode::SEE_OTHER, headers).into_response()
            }
            Err(err) => {
                error!("Invalid redirect location {location}: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}
