//! Site configuration and the shared signup state.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;

use super::{
    auth_plugin::{AuthPluginRegistry, PasswordPolicy},
    consent::{DigitalConsent, PresignupCache},
    enrol::EnrolmentTokenPlugin,
    events::EventBus,
    hooks::SignupHook,
    mailer::ConfirmationMailer,
    render::RendererRegistry,
    session::SessionStore,
    storage::UserRepository,
};

const DEFAULT_LANG: &str = "en";
const DEFAULT_CALENDAR_TYPE: &str = "gregorian";
const DEFAULT_PRESIGNUP_TTL_SECONDS: u64 = 30 * 60;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 2 * 60 * 60;

/// Custom profile field collected on the signup form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileFieldDef {
    pub shortname: String,
    pub name: String,
    pub required: bool,
}

impl ProfileFieldDef {
    /// Parse `shortname:Display name[:required]`.
    ///
    /// # Errors
    /// Returns an error if the shortname is empty or not `[a-z0-9_]`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, ':').map(str::trim);
        let shortname = parts.next().unwrap_or_default().to_lowercase();
        if shortname.is_empty()
            || !shortname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(anyhow!("Invalid profile field shortname: {value}"));
        }
        let name = parts
            .next()
            .filter(|name| !name.is_empty())
            .map_or_else(|| shortname.clone(), ToString::to_string);
        let required = match parts.next() {
            None => false,
            Some("required") => true,
            Some(other) => return Err(anyhow!("Invalid profile field flag: {other}")),
        };
        Ok(Self {
            shortname,
            name,
            required,
        })
    }

    /// Form field name used for this profile field.
    #[must_use]
    pub fn form_name(&self) -> String {
        format!("profile_field_{}", self.shortname)
    }
}

#[derive(Clone, Debug)]
pub struct SiteConfig {
    wwwroot: String,
    site_fullname: String,
    register_auth: Option<String>,
    default_lang: String,
    default_calendar_type: String,
    allow_accounts_same_email: bool,
    allowed_email_domains: Vec<String>,
    denied_email_domains: Vec<String>,
    password_policy: PasswordPolicy,
    password_reuse_limit: u32,
    digital_consent: Option<DigitalConsent>,
    presignup_ttl: Duration,
    session_ttl_seconds: i64,
    confirmation_url: Option<String>,
    notify_on_signup: bool,
    profile_fields: Vec<ProfileFieldDef>,
    policy_url: Option<String>,
    support_email: Option<String>,
}

impl SiteConfig {
    #[must_use]
    pub fn new(wwwroot: &str, site_fullname: String) -> Self {
        Self {
            wwwroot: wwwroot.trim_end_matches('/').to_string(),
            site_fullname,
            register_auth: Some("email".to_string()),
            default_lang: DEFAULT_LANG.to_string(),
            default_calendar_type: DEFAULT_CALENDAR_TYPE.to_string(),
            allow_accounts_same_email: false,
            allowed_email_domains: Vec::new(),
            denied_email_domains: Vec::new(),
            password_policy: PasswordPolicy::default(),
            password_reuse_limit: 0,
            digital_consent: None,
            presignup_ttl: Duration::from_secs(DEFAULT_PRESIGNUP_TTL_SECONDS),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            confirmation_url: None,
            notify_on_signup: true,
            profile_fields: Vec::new(),
            policy_url: None,
            support_email: None,
        }
    }

    #[must_use]
    pub fn with_register_auth(mut self, register_auth: Option<String>) -> Self {
        self.register_auth = register_auth.filter(|auth| !auth.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_default_lang(mut self, lang: String) -> Self {
        self.default_lang = lang;
        self
    }

    #[must_use]
    pub fn with_default_calendar_type(mut self, calendar_type: String) -> Self {
        self.default_calendar_type = calendar_type;
        self
    }

    #[must_use]
    pub fn with_allow_accounts_same_email(mut self, allow: bool) -> Self {
        self.allow_accounts_same_email = allow;
        self
    }

    #[must_use]
    pub fn with_allowed_email_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_email_domains = normalize_domains(domains);
        self
    }

    #[must_use]
    pub fn with_denied_email_domains(mut self, domains: Vec<String>) -> Self {
        self.denied_email_domains = normalize_domains(domains);
        self
    }

    #[must_use]
    pub fn with_password_policy(mut self, policy: PasswordPolicy) -> Self {
        self.password_policy = policy;
        self
    }

    #[must_use]
    pub fn with_password_reuse_limit(mut self, limit: u32) -> Self {
        self.password_reuse_limit = limit;
        self
    }

    #[must_use]
    pub fn with_digital_consent(mut self, consent: Option<DigitalConsent>) -> Self {
        self.digital_consent = consent;
        self
    }

    #[must_use]
    pub fn with_presignup_ttl_seconds(mut self, seconds: u64) -> Self {
        self.presignup_ttl = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_confirmation_url(mut self, url: Option<String>) -> Self {
        self.confirmation_url = url;
        self
    }

    #[must_use]
    pub fn with_notify_on_signup(mut self, notify: bool) -> Self {
        self.notify_on_signup = notify;
        self
    }

    #[must_use]
    pub fn with_profile_fields(mut self, fields: Vec<ProfileFieldDef>) -> Self {
        self.profile_fields = fields;
        self
    }

    #[must_use]
    pub fn with_policy_url(mut self, url: Option<String>) -> Self {
        self.policy_url = url;
        self
    }

    #[must_use]
    pub fn with_support_email(mut self, email: Option<String>) -> Self {
        self.support_email = email;
        self
    }

    #[must_use]
    pub fn wwwroot(&self) -> &str {
        &self.wwwroot
    }

    #[must_use]
    pub fn site_fullname(&self) -> &str {
        &self.site_fullname
    }

    #[must_use]
    pub fn register_auth(&self) -> Option<&str> {
        self.register_auth.as_deref()
    }

    #[must_use]
    pub fn default_lang(&self) -> &str {
        &self.default_lang
    }

    #[must_use]
    pub fn default_calendar_type(&self) -> &str {
        &self.default_calendar_type
    }

    #[must_use]
    pub fn allow_accounts_same_email(&self) -> bool {
        self.allow_accounts_same_email
    }

    #[must_use]
    pub fn allowed_email_domains(&self) -> &[String] {
        &self.allowed_email_domains
    }

    #[must_use]
    pub fn denied_email_domains(&self) -> &[String] {
        &self.denied_email_domains
    }

    #[must_use]
    pub fn password_policy(&self) -> &PasswordPolicy {
        &self.password_policy
    }

    #[must_use]
    pub fn password_reuse_limit(&self) -> u32 {
        self.password_reuse_limit
    }

    #[must_use]
    pub fn digital_consent(&self) -> Option<&DigitalConsent> {
        self.digital_consent.as_ref()
    }

    #[must_use]
    pub fn presignup_ttl(&self) -> Duration {
        self.presignup_ttl
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn confirmation_url(&self) -> Option<&str> {
        self.confirmation_url.as_deref()
    }

    #[must_use]
    pub fn notify_on_signup(&self) -> bool {
        self.notify_on_signup
    }

    #[must_use]
    pub fn profile_fields(&self) -> &[ProfileFieldDef] {
        &self.profile_fields
    }

    #[must_use]
    pub fn policy_url(&self) -> Option<&str> {
        self.policy_url.as_deref()
    }

    #[must_use]
    pub fn support_email(&self) -> Option<&str> {
        self.support_email.as_deref()
    }

    pub(crate) fn session_cookie_secure(&self) -> bool {
        self.wwwroot.starts_with("https://")
    }

    #[must_use]
    pub fn site_root_url(&self) -> String {
        format!("{}/", self.wwwroot)
    }

    #[must_use]
    pub fn index_url(&self) -> String {
        format!("{}/index.php", self.wwwroot)
    }

    #[must_use]
    pub fn signup_url(&self) -> String {
        format!("{}/v1/login/signup", self.wwwroot)
    }

    #[must_use]
    pub fn login_url(&self) -> String {
        format!("{}/login", self.wwwroot)
    }

    #[must_use]
    pub fn logout_url(&self) -> String {
        format!("{}/v1/login/logout", self.wwwroot)
    }

    #[must_use]
    pub fn confirm_url(&self) -> String {
        format!("{}/v1/login/confirm", self.wwwroot)
    }

    #[must_use]
    pub fn verify_age_location_url(&self) -> String {
        format!("{}/v1/login/verify-age-location", self.wwwroot)
    }

    #[must_use]
    pub fn digital_minor_url(&self) -> String {
        format!("{}/v1/login/digital-minor", self.wwwroot)
    }
}

fn normalize_domains(domains: Vec<String>) -> Vec<String> {
    domains
        .into_iter()
        .map(|domain| domain.trim().to_lowercase())
        .filter(|domain| !domain.is_empty())
        .collect()
}

/// Everything a signup request needs, shared across handlers via `Extension`.
pub struct SignupState {
    config: SiteConfig,
    plugins: AuthPluginRegistry,
    renderers: RendererRegistry,
    hooks: Vec<Arc<dyn SignupHook>>,
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionStore>,
    presignup: Arc<dyn PresignupCache>,
    events: Arc<dyn EventBus>,
    mailer: Arc<dyn ConfirmationMailer>,
    enrolment: Option<Arc<dyn EnrolmentTokenPlugin>>,
}

impl SignupState {
    pub fn new(
        config: SiteConfig,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionStore>,
        presignup: Arc<dyn PresignupCache>,
        events: Arc<dyn EventBus>,
        mailer: Arc<dyn ConfirmationMailer>,
    ) -> Self {
        Self {
            config,
            plugins: AuthPluginRegistry::with_defaults(),
            renderers: RendererRegistry::with_defaults(),
            hooks: Vec::new(),
            users,
            sessions,
            presignup,
            events,
            mailer,
            enrolment: None,
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn SignupHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn with_enrolment(mut self, enrolment: Option<Arc<dyn EnrolmentTokenPlugin>>) -> Self {
        self.enrolment = enrolment;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub(crate) fn plugins(&self) -> &AuthPluginRegistry {
        &self.plugins
    }

    pub(crate) fn renderers(&self) -> &RendererRegistry {
        &self.renderers
    }

    pub(crate) fn hooks(&self) -> &[Arc<dyn SignupHook>] {
        &self.hooks
    }

    pub(crate) fn users(&self) -> &dyn UserRepository {
        self.users.as_ref()
    }

    pub(crate) fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    pub(crate) fn presignup(&self) -> &dyn PresignupCache {
        self.presignup.as_ref()
    }

    pub(crate) fn events(&self) -> &dyn EventBus {
        self.events.as_ref()
    }

    pub(crate) fn mailer(&self) -> &dyn ConfirmationMailer {
        self.mailer.as_ref()
    }

    /// Token plugin, when installed. `None` runs the standard signup flow.
    pub(crate) fn enrolment(&self) -> Option<&dyn EnrolmentTokenPlugin> {
        self.enrolment.as_deref()
    }
}
