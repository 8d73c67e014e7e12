//! Map validated CLI arguments to the server action.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{consent, email, signup};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let signup_opts = signup::Options::parse(matches)?;
    let consent_opts = consent::Options::parse(matches)?;
    let email_opts = email::Options::parse(matches)?;

    let (mail_api_url, mail_api_token, mail_api_timeout_seconds) = match email_opts.mail_api {
        Some(api) => (Some(api.url), Some(api.token), api.timeout_seconds),
        None => (None, None, 10),
    };

    Ok(Action::Server(Args {
        port,
        dsn,
        wwwroot: signup_opts.wwwroot,
        site_name: signup_opts.site_name,
        register_auth: signup_opts.register_auth,
        enrolment_tokens: signup_opts.enrolment_tokens,
        default_lang: signup_opts.default_lang,
        calendar_type: signup_opts.calendar_type,
        allow_accounts_same_email: signup_opts.allow_accounts_same_email,
        allowed_email_domains: signup_opts.allowed_email_domains,
        denied_email_domains: signup_opts.denied_email_domains,
        confirmation_url: signup_opts.confirmation_url,
        notify_on_signup: signup_opts.notify_on_signup,
        profile_fields: signup_opts.profile_fields,
        policy_url: signup_opts.policy_url,
        support_email: signup_opts.support_email,
        session_ttl_seconds: signup_opts.session_ttl_seconds,
        password_policy: signup_opts.password_policy,
        password_reuse_limit: signup_opts.password_reuse_limit,
        digital_consent: consent_opts.digital_consent,
        presignup_ttl_seconds: consent_opts.presignup_ttl_seconds,
        email_outbox_poll_seconds: email_opts.outbox.poll_seconds,
        email_outbox_batch_size: email_opts.outbox.batch_size,
        email_outbox_max_attempts: email_opts.outbox.max_attempts,
        email_outbox_backoff_base_seconds: email_opts.outbox.backoff_base_seconds,
        email_outbox_backoff_max_seconds: email_opts.outbox.backoff_max_seconds,
        mail_api_url,
        mail_api_token,
        mail_api_timeout_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_action_from_env() {
        temp_env::with_vars(
            [
                ("ENROLGATE_PORT", Some("9000")),
                (
                    "ENROLGATE_DSN",
                    Some("postgres://enrolgate@localhost:5432/enrolgate"),
                ),
                ("ENROLGATE_ENROLMENT_TOKENS", Some("true")),
                ("ENROLGATE_MAIL_API_URL", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["enrolgate"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 9000);
                    assert_eq!(args.dsn, "postgres://enrolgate@localhost:5432/enrolgate");
                    assert!(args.enrolment_tokens);
                    assert!(args.mail_api_url.is_none());
                }
            },
        );
    }

    #[test]
    fn invalid_consent_map_fails_dispatch() {
        temp_env::with_vars(
            [
                (
                    "ENROLGATE_DSN",
                    Some("postgres://enrolgate@localhost:5432/enrolgate"),
                ),
                ("ENROLGATE_DIGITAL_CONSENT", Some("true")),
                ("ENROLGATE_AGE_OF_CONSENT_MAP", Some("AT; 14")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["enrolgate"]);
                assert!(handler(&matches).is_err());
            },
        );
    }
}
