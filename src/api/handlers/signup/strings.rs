//! User-facing strings for signup pages and validation errors.

pub(crate) const NEW_ACCOUNT: &str = "New account";
pub(crate) const LOGIN: &str = "Log in";
pub(crate) const LOGOUT: &str = "Log out";
pub(crate) const CANCEL: &str = "Cancel";
pub(crate) const EMAIL_CONFIRM: &str = "Confirm your account";
pub(crate) const SIGNUP_DISABLED: &str = "Sorry, you may not use this page.";
pub(crate) const EMAIL_NOT_SENT: &str = "Tried to send you an email but failed!";
pub(crate) const INVALID_CONFIRMATION: &str = "Invalid confirmation data";
pub(crate) const ALREADY_CONFIRMED: &str = "This account has already been confirmed.";
pub(crate) const INVALID_SESSKEY: &str = "Incorrect sesskey submitted, form not accepted!";
pub(crate) const AGE_LOCATION_TITLE: &str = "Age and location verification";
pub(crate) const DIGITAL_MINOR_TITLE: &str = "Digital minor";
pub(crate) const CONSENT_DISABLED: &str = "Age and location verification is not enabled.";
pub(crate) const POLICY_DISABLED: &str = "No site policy is configured.";

pub(crate) const MISSING_USERNAME: &str = "Missing username";
pub(crate) const USERNAME_LOWERCASE: &str = "Only lowercase letters allowed";
pub(crate) const INVALID_USERNAME: &str = "The username can only contain alphanumeric lowercase characters (letters and numbers), underscore (_), hyphen (-), period (.) or at symbol (@).";
pub(crate) const USERNAME_EXISTS: &str = "This username already exists, choose another";
pub(crate) const MISSING_EMAIL: &str = "Missing email address";
pub(crate) const INVALID_EMAIL: &str = "Invalid email address";
pub(crate) const EMAIL_EXISTS: &str = "This email address is already registered.";
pub(crate) const MISSING_PASSWORD: &str = "Missing password";
pub(crate) const MISSING_FIRSTNAME: &str = "Missing given name";
pub(crate) const MISSING_LASTNAME: &str = "Missing last name";
pub(crate) const REQUIRED: &str = "Required";
pub(crate) const INVALID_AGE: &str = "Enter an age between 0 and 150";

pub(crate) fn cannot_signup(fullname: &str) -> String {
    format!(
        "You cannot create a new account because you are already logged in as {fullname}."
    )
}

pub(crate) fn email_confirm_sent(email: &str) -> String {
    format!(
        "An email should have been sent to your address at {email}. It contains easy instructions to complete your registration. If you continue to have difficulty, contact the site administrator."
    )
}

pub(crate) fn email_not_allowed(domains: &[String]) -> String {
    format!(
        "This email is not one of those that are allowed ({})",
        domains.join(" ")
    )
}

pub(crate) fn email_denied(domains: &[String]) -> String {
    format!("This email address is not allowed ({})", domains.join(" "))
}

pub(crate) fn digital_minor(support: Option<&str>) -> String {
    let contact = support.map_or_else(
        || "the site support".to_string(),
        |email| format!("the site support at {email}"),
    );
    format!(
        "As you are under the digital age of consent in your country, you need a parent or guardian to contact {contact} to create an account."
    )
}
