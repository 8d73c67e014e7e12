use crate::api::{PasswordPolicy, ProfileFieldDef};
use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command, builder::FalseyValueParser};

pub const ARG_WWWROOT: &str = "wwwroot";
pub const ARG_SITE_NAME: &str = "site-name";
pub const ARG_REGISTER_AUTH: &str = "register-auth";
pub const ARG_ENROLMENT_TOKENS: &str = "enrolment-tokens";
pub const ARG_DEFAULT_LANG: &str = "default-lang";
pub const ARG_CALENDAR_TYPE: &str = "calendar-type";
pub const ARG_ALLOW_SAME_EMAIL: &str = "allow-accounts-same-email";
pub const ARG_ALLOWED_EMAIL_DOMAINS: &str = "allowed-email-domains";
pub const ARG_DENIED_EMAIL_DOMAINS: &str = "denied-email-domains";
pub const ARG_CONFIRMATION_URL: &str = "confirmation-url";
pub const ARG_NOTIFY_ON_SIGNUP: &str = "notify-on-signup";
pub const ARG_PROFILE_FIELD: &str = "profile-field";
pub const ARG_POLICY_URL: &str = "policy-url";
pub const ARG_SUPPORT_EMAIL: &str = "support-email";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";

pub const ARG_PASSWORD_MIN_LENGTH: &str = "password-min-length";
pub const ARG_PASSWORD_MIN_DIGITS: &str = "password-min-digits";
pub const ARG_PASSWORD_MIN_LOWER: &str = "password-min-lower";
pub const ARG_PASSWORD_MIN_UPPER: &str = "password-min-upper";
pub const ARG_PASSWORD_MIN_NONALNUM: &str = "password-min-nonalnum";
pub const ARG_PASSWORD_REUSE_LIMIT: &str = "password-reuse-limit";

#[derive(Debug)]
pub struct Options {
    pub wwwroot: String,
    pub site_name: String,
    pub register_auth: Option<String>,
    pub enrolment_tokens: bool,
    pub default_lang: String,
    pub calendar_type: String,
    pub allow_accounts_same_email: bool,
    pub allowed_email_domains: Vec<String>,
    pub denied_email_domains: Vec<String>,
    pub confirmation_url: Option<String>,
    pub notify_on_signup: bool,
    pub profile_fields: Vec<ProfileFieldDef>,
    pub policy_url: Option<String>,
    pub support_email: Option<String>,
    pub session_ttl_seconds: i64,
    pub password_policy: PasswordPolicy,
    pub password_reuse_limit: u32,
}

impl Options {
    /// Parse signup arguments from matches.
    ///
    /// # Errors
    /// Returns an error if `--wwwroot` is missing or a profile field definition is invalid.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        // Helper to filter empty strings which clap might pass through if env vars are set to ""
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };
        let get_list = |id: &str| -> Vec<String> {
            matches
                .get_many::<String>(id)
                .map(|values| {
                    values
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        let Some(wwwroot) = get_non_empty(ARG_WWWROOT) else {
            anyhow::bail!("missing required argument: --{ARG_WWWROOT}");
        };

        let profile_fields = get_list(ARG_PROFILE_FIELD)
            .iter()
            .map(|value| ProfileFieldDef::parse(value))
            .collect::<Result<Vec<_>>>()?;

        let count = |id: &str, default: usize| matches.get_one::<usize>(id).copied().unwrap_or(default);
        let password_policy = PasswordPolicy::new()
            .with_min_length(count(ARG_PASSWORD_MIN_LENGTH, 8))
            .with_min_digits(count(ARG_PASSWORD_MIN_DIGITS, 1))
            .with_min_lower(count(ARG_PASSWORD_MIN_LOWER, 1))
            .with_min_upper(count(ARG_PASSWORD_MIN_UPPER, 1))
            .with_min_nonalnum(count(ARG_PASSWORD_MIN_NONALNUM, 1));

        Ok(Self {
            wwwroot,
            site_name: get_non_empty(ARG_SITE_NAME).unwrap_or_else(|| "Enrolgate".to_string()),
            register_auth: get_non_empty(ARG_REGISTER_AUTH).filter(|auth| auth != "none"),
            enrolment_tokens: matches.get_flag(ARG_ENROLMENT_TOKENS),
            default_lang: get_non_empty(ARG_DEFAULT_LANG).unwrap_or_else(|| "en".to_string()),
            calendar_type: get_non_empty(ARG_CALENDAR_TYPE)
                .unwrap_or_else(|| "gregorian".to_string()),
            allow_accounts_same_email: matches.get_flag(ARG_ALLOW_SAME_EMAIL),
            allowed_email_domains: get_list(ARG_ALLOWED_EMAIL_DOMAINS),
            denied_email_domains: get_list(ARG_DENIED_EMAIL_DOMAINS),
            confirmation_url: get_non_empty(ARG_CONFIRMATION_URL),
            notify_on_signup: matches
                .get_one::<bool>(ARG_NOTIFY_ON_SIGNUP)
                .copied()
                .unwrap_or(true),
            profile_fields,
            policy_url: get_non_empty(ARG_POLICY_URL),
            support_email: get_non_empty(ARG_SUPPORT_EMAIL),
            session_ttl_seconds: matches
                .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
                .copied()
                .unwrap_or(7200),
            password_policy,
            password_reuse_limit: matches
                .get_one::<u32>(ARG_PASSWORD_REUSE_LIMIT)
                .copied()
                .unwrap_or(0),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_site_args(command);
    let command = with_form_args(command);
    with_password_args(command)
}

fn with_site_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_WWWROOT)
                .long(ARG_WWWROOT)
                .help("Public base URL of the site, used for redirects and confirmation links")
                .env("ENROLGATE_WWWROOT")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_SITE_NAME)
                .long(ARG_SITE_NAME)
                .help("Full site name shown on pages and in emails")
                .env("ENROLGATE_SITE_NAME")
                .default_value("Enrolgate"),
        )
        .arg(
            Arg::new(ARG_REGISTER_AUTH)
                .long(ARG_REGISTER_AUTH)
                .help("Auth plugin used for self registration, `none` disables signup")
                .env("ENROLGATE_REGISTER_AUTH")
                .default_value("email"),
        )
        .arg(
            Arg::new(ARG_ENROLMENT_TOKENS)
                .long(ARG_ENROLMENT_TOKENS)
                .help("Enable the enrolment token field and redeem tokens after signup")
                .env("ENROLGATE_ENROLMENT_TOKENS")
                .action(ArgAction::SetTrue)
                .value_parser(FalseyValueParser::new()),
        )
        .arg(
            Arg::new(ARG_CONFIRMATION_URL)
                .long(ARG_CONFIRMATION_URL)
                .help("Base URL for confirmation links, defaults to the built-in confirm page")
                .env("ENROLGATE_CONFIRMATION_URL"),
        )
        .arg(
            Arg::new(ARG_NOTIFY_ON_SIGNUP)
                .long(ARG_NOTIFY_ON_SIGNUP)
                .help("Show the check-your-email page after signup")
                .env("ENROLGATE_NOTIFY_ON_SIGNUP")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_POLICY_URL)
                .long(ARG_POLICY_URL)
                .help("Site policy URL; when set, visitors must accept it before signing up")
                .env("ENROLGATE_POLICY_URL"),
        )
        .arg(
            Arg::new(ARG_SUPPORT_EMAIL)
                .long(ARG_SUPPORT_EMAIL)
                .help("Support contact shown on the digital minor page")
                .env("ENROLGATE_SUPPORT_EMAIL"),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Idle session lifetime in seconds")
                .env("ENROLGATE_SESSION_TTL_SECONDS")
                .default_value("7200")
                .value_parser(clap::value_parser!(i64).range(60..)),
        )
}

fn with_form_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DEFAULT_LANG)
                .long(ARG_DEFAULT_LANG)
                .help("Language stored on new accounts")
                .env("ENROLGATE_DEFAULT_LANG")
                .default_value("en"),
        )
        .arg(
            Arg::new(ARG_CALENDAR_TYPE)
                .long(ARG_CALENDAR_TYPE)
                .help("Calendar type stored on new accounts")
                .env("ENROLGATE_CALENDAR_TYPE")
                .default_value("gregorian"),
        )
        .arg(
            Arg::new(ARG_ALLOW_SAME_EMAIL)
                .long(ARG_ALLOW_SAME_EMAIL)
                .help("Allow several accounts to share one email address")
                .env("ENROLGATE_ALLOW_ACCOUNTS_SAME_EMAIL")
                .action(ArgAction::SetTrue)
                .value_parser(FalseyValueParser::new()),
        )
        .arg(
            Arg::new(ARG_ALLOWED_EMAIL_DOMAINS)
                .long(ARG_ALLOWED_EMAIL_DOMAINS)
                .help("Only accept emails from these domains (comma separated)")
                .env("ENROLGATE_ALLOWED_EMAIL_DOMAINS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_DENIED_EMAIL_DOMAINS)
                .long(ARG_DENIED_EMAIL_DOMAINS)
                .help("Reject emails from these domains (comma separated)")
                .env("ENROLGATE_DENIED_EMAIL_DOMAINS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_PROFILE_FIELD)
                .long(ARG_PROFILE_FIELD)
                .help("Custom profile field `shortname:Display name[:required]`, repeatable")
                .env("ENROLGATE_PROFILE_FIELDS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
}

fn with_password_args(command: Command) -> Command {
    let count_arg = |id: &'static str, env: &'static str, help: &'static str, default: &'static str| {
        Arg::new(id)
            .long(id)
            .help(help)
            .env(env)
            .default_value(default)
            .value_parser(clap::value_parser!(usize))
    };

    command
        .arg(count_arg(
            ARG_PASSWORD_MIN_LENGTH,
            "ENROLGATE_PASSWORD_MIN_LENGTH",
            "Minimum password length",
            "8",
        ))
        .arg(count_arg(
            ARG_PASSWORD_MIN_DIGITS,
            "ENROLGATE_PASSWORD_MIN_DIGITS",
            "Minimum digits in a password",
            "1",
        ))
        .arg(count_arg(
            ARG_PASSWORD_MIN_LOWER,
            "ENROLGATE_PASSWORD_MIN_LOWER",
            "Minimum lower case letters in a password",
            "1",
        ))
        .arg(count_arg(
            ARG_PASSWORD_MIN_UPPER,
            "ENROLGATE_PASSWORD_MIN_UPPER",
            "Minimum upper case letters in a password",
            "1",
        ))
        .arg(count_arg(
            ARG_PASSWORD_MIN_NONALNUM,
            "ENROLGATE_PASSWORD_MIN_NONALNUM",
            "Minimum non-alphanumeric characters in a password",
            "1",
        ))
        .arg(
            Arg::new(ARG_PASSWORD_REUSE_LIMIT)
                .long(ARG_PASSWORD_REUSE_LIMIT)
                .help("Number of previous password hashes to keep, 0 disables history")
                .env("ENROLGATE_PASSWORD_REUSE_LIMIT")
                .default_value("0")
                .value_parser(clap::value_parser!(u32)),
        )
}
