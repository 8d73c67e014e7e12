use crate::api::{
    self, DigitalConsent, EmailSender, EmailWorkerConfig, HttpEmailSender, LogEmailSender,
    PasswordPolicy, ProfileFieldDef, SiteConfig,
};
use anyhow::Result;
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
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
    pub digital_consent: Option<DigitalConsent>,
    pub presignup_ttl_seconds: u64,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
    pub mail_api_url: Option<String>,
    pub mail_api_token: Option<SecretString>,
    pub mail_api_timeout_seconds: u64,
}

impl Args {
    fn site_config(&self) -> SiteConfig {
        SiteConfig::new(&self.wwwroot, self.site_name.clone())
            .with_register_auth(self.register_auth.clone())
            .with_default_lang(self.default_lang.clone())
            .with_default_calendar_type(self.calendar_type.clone())
            .with_allow_accounts_same_email(self.allow_accounts_same_email)
            .with_allowed_email_domains(self.allowed_email_domains.clone())
            .with_denied_email_domains(self.denied_email_domains.clone())
            .with_password_policy(self.password_policy.clone())
            .with_password_reuse_limit(self.password_reuse_limit)
            .with_digital_consent(self.digital_consent.clone())
            .with_presignup_ttl_seconds(self.presignup_ttl_seconds)
            .with_session_ttl_seconds(self.session_ttl_seconds)
            .with_confirmation_url(self.confirmation_url.clone())
            .with_notify_on_signup(self.notify_on_signup)
            .with_profile_fields(self.profile_fields.clone())
            .with_policy_url(self.policy_url.clone())
            .with_support_email(self.support_email.clone())
    }

    fn email_config(&self) -> EmailWorkerConfig {
        EmailWorkerConfig::new()
            .with_poll_interval_seconds(self.email_outbox_poll_seconds)
            .with_batch_size(self.email_outbox_batch_size)
            .with_max_attempts(self.email_outbox_max_attempts)
            .with_backoff_base_seconds(self.email_outbox_backoff_base_seconds)
            .with_backoff_max_seconds(self.email_outbox_backoff_max_seconds)
    }

    fn email_sender(&self) -> Result<Arc<dyn EmailSender>> {
        match (&self.mail_api_url, &self.mail_api_token) {
            (Some(url), Some(token)) => {
                info!("Delivering email through {url}");
                Ok(Arc::new(HttpEmailSender::new(
                    url.clone(),
                    token.clone(),
                    Duration::from_secs(self.mail_api_timeout_seconds),
                )?))
            }
            _ => {
                info!("No mail API configured, outgoing email is only logged");
                Ok(Arc::new(LogEmailSender))
            }
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the mail client cannot be built or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("server args: {:?}", args);

    let site = args.site_config();
    let email_config = args.email_config();
    let email_sender = args.email_sender()?;

    api::new(
        args.port,
        args.dsn,
        site,
        args.enrolment_tokens,
        email_config,
        email_sender,
    )
    .await
}
