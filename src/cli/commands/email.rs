use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_OUTBOX_POLL_SECONDS: &str = "email-outbox-poll-seconds";
pub const ARG_OUTBOX_BATCH_SIZE: &str = "email-outbox-batch-size";
pub const ARG_OUTBOX_MAX_ATTEMPTS: &str = "email-outbox-max-attempts";
pub const ARG_OUTBOX_BACKOFF_BASE_SECONDS: &str = "email-outbox-backoff-base-seconds";
pub const ARG_OUTBOX_BACKOFF_MAX_SECONDS: &str = "email-outbox-backoff-max-seconds";
pub const ARG_MAIL_API_URL: &str = "mail-api-url";
pub const ARG_MAIL_API_TOKEN: &str = "mail-api-token";
pub const ARG_MAIL_API_TIMEOUT_SECONDS: &str = "mail-api-timeout-seconds";

#[derive(Debug)]
pub struct OutboxOptions {
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

#[derive(Debug)]
pub struct MailApiOptions {
    pub url: String,
    pub token: SecretString,
    pub timeout_seconds: u64,
}

#[derive(Debug)]
pub struct Options {
    pub outbox: OutboxOptions,
    pub mail_api: Option<MailApiOptions>,
}

impl Options {
    /// Parse outbox and delivery arguments.
    ///
    /// # Errors
    /// Returns an error if `--mail-api-url` is set without `--mail-api-token`.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let outbox = OutboxOptions {
            poll_seconds: matches
                .get_one::<u64>(ARG_OUTBOX_POLL_SECONDS)
                .copied()
                .unwrap_or(5),
            batch_size: matches
                .get_one::<usize>(ARG_OUTBOX_BATCH_SIZE)
                .copied()
                .unwrap_or(10),
            max_attempts: matches
                .get_one::<u32>(ARG_OUTBOX_MAX_ATTEMPTS)
                .copied()
                .unwrap_or(5),
            backoff_base_seconds: matches
                .get_one::<u64>(ARG_OUTBOX_BACKOFF_BASE_SECONDS)
                .copied()
                .unwrap_or(5),
            backoff_max_seconds: matches
                .get_one::<u64>(ARG_OUTBOX_BACKOFF_MAX_SECONDS)
                .copied()
                .unwrap_or(300),
        };

        let mail_api = match get_non_empty(ARG_MAIL_API_URL) {
            Some(url) => {
                let Some(token) = get_non_empty(ARG_MAIL_API_TOKEN) else {
                    anyhow::bail!(
                        "missing required argument: --{ARG_MAIL_API_TOKEN} (required with --{ARG_MAIL_API_URL})"
                    );
                };
                Some(MailApiOptions {
                    url,
                    token: SecretString::from(token),
                    timeout_seconds: matches
                        .get_one::<u64>(ARG_MAIL_API_TIMEOUT_SECONDS)
                        .copied()
                        .unwrap_or(10),
                })
            }
            None => None,
        };

        Ok(Self { outbox, mail_api })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_outbox_args(command);
    with_mail_api_args(command)
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OUTBOX_POLL_SECONDS)
                .long(ARG_OUTBOX_POLL_SECONDS)
                .help("Email outbox poll interval in seconds")
                .env("ENROLGATE_EMAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OUTBOX_BATCH_SIZE)
                .long(ARG_OUTBOX_BATCH_SIZE)
                .help("Email outbox batch size per poll")
                .env("ENROLGATE_EMAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_OUTBOX_MAX_ATTEMPTS)
                .long(ARG_OUTBOX_MAX_ATTEMPTS)
                .help("Max attempts before marking an email as failed")
                .env("ENROLGATE_EMAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_OUTBOX_BACKOFF_BASE_SECONDS)
                .long(ARG_OUTBOX_BACKOFF_BASE_SECONDS)
                .help("Base delay for email outbox retry backoff")
                .env("ENROLGATE_EMAIL_OUTBOX_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OUTBOX_BACKOFF_MAX_SECONDS)
                .long(ARG_OUTBOX_BACKOFF_MAX_SECONDS)
                .help("Max delay for email outbox retry backoff")
                .env("ENROLGATE_EMAIL_OUTBOX_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_mail_api_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAIL_API_URL)
                .long(ARG_MAIL_API_URL)
                .help("Mail delivery API endpoint; emails are only logged when unset")
                .env("ENROLGATE_MAIL_API_URL"),
        )
        .arg(
            Arg::new(ARG_MAIL_API_TOKEN)
                .long(ARG_MAIL_API_TOKEN)
                .help("Bearer token for the mail delivery API")
                .env("ENROLGATE_MAIL_API_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_MAIL_API_TIMEOUT_SECONDS)
                .long(ARG_MAIL_API_TIMEOUT_SECONDS)
                .help("Mail delivery API request timeout in seconds")
                .env("ENROLGATE_MAIL_API_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
}
