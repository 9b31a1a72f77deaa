//! Local form validation.
//!
//! Everything here runs before a request is built; a value that fails
//! validation is never sent to the backend.

use thiserror::Error;

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Characters stripped from free-text submission fields.
const UNSAFE_INPUT_CHARS: &[char] = &['?', '<', '>', '|', '\'', '"', '$', '^', '&', '{', '}'];

/// A form value rejected before reaching the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter a valid email address.")]
    InvalidEmail,

    #[error("Password must be at least {min} characters long.")]
    PasswordTooShort { min: usize },

    #[error("Passwords do not match.")]
    PasswordMismatch,

    #[error("{field} is required.")]
    MissingField { field: &'static str },
}

/// Checks that `email` looks like `local@domain.tld`.
///
/// This is a shape check only; the auth service has the final say.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let email = email.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidEmail);
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::InvalidEmail);
    };

    let domain_ok = !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'));

    if local.is_empty() || !domain_ok {
        return Err(ValidationError::InvalidEmail);
    }

    Ok(())
}

/// Checks the password length.
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooShort {
            min: MIN_PASSWORD_LENGTH,
        });
    }
    Ok(())
}

/// Checks a new password and its confirmation.
///
/// A mismatch is reported before the length check.
pub fn validate_new_password(password: &str, confirmation: &str) -> Result<(), ValidationError> {
    if password != confirmation {
        return Err(ValidationError::PasswordMismatch);
    }
    validate_password(password)
}

/// Rejects empty or whitespace-only required fields.
pub fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    Ok(())
}

/// Removes all whitespace. Password inputs are normalized this way.
pub fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Removes characters that are never valid in a submission field.
pub fn sanitize_input(value: &str) -> String {
    value
        .chars()
        .filter(|c| !UNSAFE_INPUT_CHARS.contains(c))
        .collect()
}
