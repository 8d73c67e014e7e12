use crate::api::handlers::{
    health,
    signup::{
        self, BroadcastEventBus, MemoryPresignupCache, MemorySessionStore, OutboxMailer,
        PgTokenEnrolment, PgUserRepository, PolicyAgreementHook, SignupState,
    },
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{get, post},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

// Keep these internal to the crate while allowing CLI/server wiring to reference them.
pub(crate) mod email;
pub(crate) mod handlers;
mod openapi;

pub use email::{EmailSender, EmailWorkerConfig, HttpEmailSender, LogEmailSender};
pub use handlers::signup::{DigitalConsent, PasswordPolicy, ProfileFieldDef, SiteConfig};
pub use openapi::openapi;

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    site: SiteConfig,
    enrolment_tokens: bool,
    email_config: EmailWorkerConfig,
    email_sender: Arc<dyn EmailSender>,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let state = Arc::new(signup_state(&pool, site, enrolment_tokens));

    // Background worker polls email_outbox for pending confirmation emails,
    // delivers them, and retries failures with exponential backoff.
    email::spawn_outbox_worker(pool.clone(), email_sender, email_config);

    let app = router(state, pool);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    crate::cli::telemetry::shutdown_tracer();

    Ok(())
}

/// Wire the Postgres-backed services, in-memory session stores and optional
/// plugins into the shared signup state.
fn signup_state(pool: &PgPool, site: SiteConfig, enrolment_tokens: bool) -> SignupState {
    let session_ttl = Duration::from_secs(u64::try_from(site.session_ttl_seconds()).unwrap_or(0));
    let presignup_ttl = site.presignup_ttl();
    let policy_enabled = site.policy_url().is_some();

    let events = BroadcastEventBus::new();
    signup::spawn_event_logger(&events);

    let state = SignupState::new(
        site,
        Arc::new(PgUserRepository::new(pool.clone())),
        Arc::new(MemorySessionStore::new(session_ttl)),
        Arc::new(MemoryPresignupCache::new(presignup_ttl)),
        Arc::new(events),
        Arc::new(OutboxMailer::new(pool.clone())),
    );

    let state = if policy_enabled {
        state.with_hook(Arc::new(PolicyAgreementHook))
    } else {
        state
    };

    if enrolment_tokens {
        info!("Enrolment token plugin enabled");
        state.with_enrolment(Some(Arc::new(PgTokenEnrolment::new(pool.clone()))))
    } else {
        state
    }
}

fn router(state: Arc<SignupState>, pool: PgPool) -> Router {
    Router::new()
        .route(
            "/v1/login/signup",
            get(signup::page::signup_form).post(signup::page::signup_submit),
        )
        .route(
            "/v1/login/verify-age-location",
            get(signup::consent::verify_age_location_form).post(signup::consent::verify_age_location),
        )
        .route("/v1/login/digital-minor", get(signup::consent::digital_minor))
        .route("/v1/login/policy/accept", post(signup::hooks::accept_policy))
        .route("/v1/login/confirm", get(signup::account::confirm))
        .route("/v1/login/logout", post(signup::account::logout))
        .route("/health", get(health).head(health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state))
                .layer(Extension(pool)),
        )
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
