//! Auth plugins that provide the signup form and validate submissions.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::{
    render::{FormField, SignupForm},
    state::SiteConfig,
    storage::UserRepository,
    strings,
    types::{FieldError, SignupSubmission},
    utils::{email_domain_matches, normalize_email, valid_email, valid_username},
};

/// Password rules applied on signup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswordPolicy {
    min_length: usize,
    min_digits: usize,
    min_lower: usize,
    min_upper: usize,
    min_nonalnum: usize,
}

impl PasswordPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_length: 8,
            min_digits: 1,
            min_lower: 1,
            min_upper: 1,
            min_nonalnum: 1,
        }
    }

    #[must_use]
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    #[must_use]
    pub fn with_min_digits(mut self, min_digits: usize) -> Self {
        self.min_digits = min_digits;
        self
    }

    #[must_use]
    pub fn with_min_lower(mut self, min_lower: usize) -> Self {
        self.min_lower = min_lower;
        self
    }

    #[must_use]
    pub fn with_min_upper(mut self, min_upper: usize) -> Self {
        self.min_upper = min_upper;
        self
    }

    #[must_use]
    pub fn with_min_nonalnum(mut self, min_nonalnum: usize) -> Self {
        self.min_nonalnum = min_nonalnum;
        self
    }

    /// Every rule the password breaks, joined into one message.
    #[must_use]
    pub fn check(&self, password: &str) -> Option<String> {
        let count = |predicate: fn(&char) -> bool| password.chars().filter(predicate).count();
        let mut problems = Vec::new();
        if password.chars().count() < self.min_length {
            problems.push(format!(
                "Passwords must be at least {} characters long.",
                self.min_length
            ));
        }
        if count(char::is_ascii_digit) < self.min_digits {
            problems.push(format!(
                "Passwords must have at least {} digit(s).",
                self.min_digits
            ));
        }
        if count(|c| c.is_lowercase()) < self.min_lower {
            problems.push(format!(
                "Passwords must have at least {} lower case letter(s).",
                self.min_lower
            ));
        }
        if count(|c| c.is_uppercase()) < self.min_upper {
            problems.push(format!(
                "Passwords must have at least {} upper case letter(s).",
                self.min_upper
            ));
        }
        if count(|c| !c.is_alphanumeric()) < self.min_nonalnum {
            problems.push(format!(
                "The password must have at least {} special character(s) such as *, -, or #.",
                self.min_nonalnum
            ));
        }
        if problems.is_empty() {
            None
        } else {
            Some(problems.join(" "))
        }
    }
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait AuthPlugin: Send + Sync {
    fn authtype(&self) -> &str;

    fn can_signup(&self) -> bool;

    /// Build the signup form. `with_token` adds the enrolment token field.
    fn signup_form(
        &self,
        config: &SiteConfig,
        with_token: bool,
        defaults: &SignupSubmission,
    ) -> SignupForm;

    /// Field errors for a submission; empty when it can be accepted.
    ///
    /// # Errors
    /// Returns an error if uniqueness lookups fail.
    async fn validate(
        &self,
        submission: &SignupSubmission,
        users: &dyn UserRepository,
        config: &SiteConfig,
    ) -> Result<Vec<FieldError>>;
}

/// Email-confirmed self registration.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmailAuth;

impl EmailAuth {
    async fn validate_username(
        username: &str,
        users: &dyn UserRepository,
        errors: &mut Vec<FieldError>,
    ) -> Result<()> {
        if username.is_empty() {
            errors.push(FieldError::new("username", strings::MISSING_USERNAME));
        } else if username != username.to_lowercase() {
            errors.push(FieldError::new("username", strings::USERNAME_LOWERCASE));
        } else if !valid_username(username) {
            errors.push(FieldError::new("username", strings::INVALID_USERNAME));
        } else if users.username_exists(username).await? {
            errors.push(FieldError::new("username", strings::USERNAME_EXISTS));
        }
        Ok(())
    }

    async fn validate_email(
        submission: &SignupSubmission,
        users: &dyn UserRepository,
        config: &SiteConfig,
        errors: &mut Vec<FieldError>,
    ) -> Result<()> {
        let email = normalize_email(&submission.email);
        if email.is_empty() {
            errors.push(FieldError::new("email", strings::MISSING_EMAIL));
        } else if !valid_email(&email) {
            errors.push(FieldError::new("email", strings::INVALID_EMAIL));
        } else if !config.allow_accounts_same_email() && users.email_exists(&email).await? {
            errors.push(FieldError::new("email", strings::EMAIL_EXISTS));
        } else if let Some(message) = domain_error(&email, config) {
            errors.push(FieldError::new("email", message));
        }

        let email2 = normalize_email(&submission.email2);
        if email2.is_empty() {
            errors.push(FieldError::new("email2", strings::MISSING_EMAIL));
        } else if email2 != email {
            errors.push(FieldError::new("email2", strings::INVALID_EMAIL));
        }
        Ok(())
    }
}

/// Allowed domains win over denied ones.
fn domain_error(email: &str, config: &SiteConfig) -> Option<String> {
    let allowed = config.allowed_email_domains();
    if !allowed.is_empty() {
        if allowed
            .iter()
            .any(|domain| email_domain_matches(email, domain))
        {
            return None;
        }
        return Some(strings::email_not_allowed(allowed));
    }
    let denied = config.denied_email_domains();
    denied
        .iter()
        .any(|domain| email_domain_matches(email, domain))
        .then(|| strings::email_denied(denied))
}

#[async_trait]
impl AuthPlugin for EmailAuth {
    fn authtype(&self) -> &str {
        "email"
    }

    fn can_signup(&self) -> bool {
        true
    }

    fn signup_form(
        &self,
        config: &SiteConfig,
        with_token: bool,
        defaults: &SignupSubmission,
    ) -> SignupForm {
        let mut fields = vec![
            FormField::new("username", "Username", "text", "createuserandpass")
                .required()
                .with_value(Some(&defaults.username)),
            FormField::new("password", "Password", "password", "createuserandpass").required(),
            FormField::new("email", "Email address", "email", "supplyinfo")
                .required()
                .with_value(Some(&defaults.email)),
            FormField::new("email2", "Email (again)", "email", "supplyinfo")
                .required()
                .with_value(Some(&defaults.email2)),
            FormField::new("firstname", "First name", "text", "supplyinfo")
                .required()
                .with_value(Some(&defaults.firstname)),
            FormField::new("lastname", "Last name", "text", "supplyinfo")
                .required()
                .with_value(Some(&defaults.lastname)),
            FormField::new("city", "City/town", "text", "supplyinfo")
                .with_value(Some(&defaults.city)),
            FormField::new("country", "Country", "country", "supplyinfo")
                .with_value(Some(&defaults.country)),
        ];

        for profile_field in config.profile_fields() {
            let mut field = FormField::new(
                &profile_field.form_name(),
                &profile_field.name,
                "text",
                "profile",
            )
            .with_value(
                defaults
                    .profile_fields
                    .get(&profile_field.shortname)
                    .map(String::as_str),
            );
            field.required = profile_field.required;
            fields.push(field);
        }

        if with_token {
            fields.push(
                FormField::new("token", "Enrolment token", "text", "enrolment")
                    .with_value(defaults.token.as_deref()),
            );
        }

        SignupForm {
            component: format!("auth_{}", self.authtype()),
            action: config.signup_url(),
            fields,
            renderable: true,
        }
    }

    async fn validate(
        &self,
        submission: &SignupSubmission,
        users: &dyn UserRepository,
        config: &SiteConfig,
    ) -> Result<Vec<FieldError>> {
        let mut errors = Vec::new();

        Self::validate_username(submission.username.trim(), users, &mut errors).await?;
        Self::validate_email(submission, users, config, &mut errors).await?;

        if submission.password.is_empty() {
            errors.push(FieldError::new("password", strings::MISSING_PASSWORD));
        } else if let Some(message) = config.password_policy().check(&submission.password) {
            errors.push(FieldError::new("password", message));
        }

        if submission.firstname.trim().is_empty() {
            errors.push(FieldError::new("firstname", strings::MISSING_FIRSTNAME));
        }
        if submission.lastname.trim().is_empty() {
            errors.push(FieldError::new("lastname", strings::MISSING_LASTNAME));
        }

        for field in config.profile_fields().iter().filter(|field| field.required) {
            let present = submission
                .profile_fields
                .get(&field.shortname)
                .is_some_and(|value| !value.trim().is_empty());
            if !present {
                errors.push(FieldError::new(&field.form_name(), strings::REQUIRED));
            }
        }

        Ok(errors)
    }
}

/// Installed auth plugins, looked up by `authtype`.
#[derive(Clone)]
pub struct AuthPluginRegistry {
    plugins: Vec<Arc<dyn AuthPlugin>>,
}

impl AuthPluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().with_plugin(Arc::new(EmailAuth))
    }

    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Plugin configured for self registration, if it allows signup.
    #[must_use]
    pub fn signup_plugin(&self, register_auth: Option<&str>) -> Option<Arc<dyn AuthPlugin>> {
        let authtype = register_auth?;
        self.plugins
            .iter()
            .find(|plugin| plugin.authtype() == authtype && plugin.can_signup())
            .cloned()
    }
}

impl Default for AuthPluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
