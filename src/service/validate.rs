//! Local request validation: shapes and length bounds only, no policy.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{ServiceError, ServiceResult};

const PASSWORD_MIN: usize = 6;
const PASSWORD_MAX: usize = 32;
const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

pub(crate) fn valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

pub(crate) fn validate_email(email: &str) -> ServiceResult<()> {
    if valid_email(email) {
        Ok(())
    } else {
        Err(ServiceError::invalid_argument("invalid email address"))
    }
}

pub(crate) fn validate_password(password: &str) -> ServiceResult<()> {
    let len = password.chars().count();
    if (PASSWORD_MIN..=PASSWORD_MAX).contains(&len) {
        Ok(())
    } else {
        Err(ServiceError::invalid_argument(format!(
            "password must be between {PASSWORD_MIN} and {PASSWORD_MAX} characters"
        )))
    }
}

pub(crate) fn validate_username(username: &str) -> ServiceResult<()> {
    let len = username.chars().count();
    if (USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        Ok(())
    } else {
        Err(ServiceError::invalid_argument(format!(
            "username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        )))
    }
}

pub(crate) fn validate_signup(
    email: &str,
    username: &str,
    password: &str,
    repeat_password: Option<&str>,
) -> ServiceResult<()> {
    validate_email(email)?;
    validate_username(username)?;
    validate_password(password)?;
    if let Some(repeat) = repeat_password {
        if repeat != password {
            return Err(ServiceError::invalid_argument("passwords do not match"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn password_length_bounds_are_inclusive() {
        assert!(validate_password("123456").is_ok());
        assert!(validate_password(&"x".repeat(32)).is_ok());
        assert!(validate_password("12345").is_err());
        assert!(validate_password(&"x".repeat(33)).is_err());
    }

    #[test]
    fn username_length_bounds_are_inclusive() {
        assert!(validate_username("abc").is_ok());
        assert!(validate_username(&"u".repeat(32)).is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"u".repeat(33)).is_err());
    }

    #[test]
    fn signup_rejects_mismatched_repeat_password() {
        let err = validate_signup("a@b.c", "alice", "secret1", Some("secret2"))
            .expect_err("must fail");
        assert_eq!(err.kind, Kind::InvalidArgument);
    }

    #[test]
    fn signup_accepts_matching_or_absent_repeat() {
        assert!(validate_signup("a@b.c", "alice", "secret1", Some("secret1")).is_ok());
        assert!(validate_signup("a@b.c", "alice", "secret1", None).is_ok());
    }
}
