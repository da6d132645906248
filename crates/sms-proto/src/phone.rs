use std::sync::LazyLock;

use regex::Regex;

static E164_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").unwrap());

/// Returned when a phone number is not in E.164 format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid phone number {0:?}, must be E.164 format")]
pub struct InvalidPhoneNumber(pub String);

/// Validates that `number` is a well-formed E.164 phone number.
pub fn validate_phone_number(number: &str) -> Result<(), InvalidPhoneNumber> {
    if E164_RE.is_match(number) {
        Ok(())
    } else {
        Err(InvalidPhoneNumber(number.to_string()))
    }
}
