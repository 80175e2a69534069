//! Handle normalization and validation
//!
//! Raw input such as `"  @Alice_01 "` is canonicalized to `alice_01` before
//! any rule is applied. Only canonical, validated strings can become a
//! [`Handle`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Leading character users commonly type in front of a handle.
pub const HANDLE_SIGIL: char = '@';
/// Minimum handle length, in characters, after normalization.
pub const MIN_HANDLE_LEN: usize = 3;
/// Maximum handle length, in characters, after normalization.
pub const MAX_HANDLE_LEN: usize = 30;
/// Namespace shared by every reservation entry in the lease store.
pub const RESERVATION_KEY_PREFIX: &str = "handle:reservation:";

/// System words that can never be reserved by users.
const RESERVED_HANDLES: &[&str] = &[
    "about",
    "admin",
    "administrator",
    "api",
    "app",
    "help",
    "ippan",
    "login",
    "logout",
    "mail",
    "mod",
    "moderator",
    "null",
    "official",
    "register",
    "root",
    "security",
    "settings",
    "signup",
    "staff",
    "status",
    "support",
    "system",
    "undefined",
    "www",
];

/// Reasons a raw handle is rejected, in the order the rules are applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleValidationError {
    #[error("handle must be a non-empty string")]
    Empty,

    #[error("handle is empty after normalization")]
    EmptyAfterNormalization,

    #[error("handle is too short: {len} characters, at least 3 required")]
    TooShort { len: usize },

    #[error("handle is too long: {len} characters, at most 30 allowed")]
    TooLong { len: usize },

    #[error("handle contains invalid characters; only letters, digits and '_' are allowed")]
    InvalidCharacters,

    #[error("handle must not start with '_'")]
    LeadingUnderscore,

    #[error("handle must not end with '_'")]
    TrailingUnderscore,

    #[error("handle must not contain consecutive underscores")]
    ConsecutiveUnderscores,
}

/// Canonicalize raw input: drop the leading sigil and surrounding whitespace,
/// then lowercase.
///
/// Repeated sigils are stripped as well, so `normalize(normalize(s)) ==
/// normalize(s)` holds for every input.
pub fn normalize(raw: &str) -> String {
    raw.trim_start_matches(|c: char| c == HANDLE_SIGIL || c.is_whitespace())
        .trim_end()
        .to_lowercase()
}

/// Validate raw input, reporting the first rule it breaks.
pub fn validate(raw: &str) -> Result<(), HandleValidationError> {
    canonicalize(raw).map(|_| ())
}

/// Case-insensitive membership test against the system deny-list.
pub fn is_reserved(raw: &str) -> bool {
    let normalized = normalize(raw);
    RESERVED_HANDLES.contains(&normalized.as_str())
}

/// Storage key for the reservation entry of `handle`.
pub fn reservation_key(handle: &Handle) -> String {
    format!("{RESERVATION_KEY_PREFIX}{}", handle.as_str())
}

fn canonicalize(raw: &str) -> Result<String, HandleValidationError> {
    if raw.is_empty() {
        return Err(HandleValidationError::Empty);
    }

    let normalized = normalize(raw);
    if normalized.is_empty() {
        return Err(HandleValidationError::EmptyAfterNormalization);
    }

    let len = normalized.chars().count();
    if len < MIN_HANDLE_LEN {
        return Err(HandleValidationError::TooShort { len });
    }
    if len > MAX_HANDLE_LEN {
        return Err(HandleValidationError::TooLong { len });
    }

    if !normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(HandleValidationError::InvalidCharacters);
    }
    if normalized.starts_with('_') {
        return Err(HandleValidationError::LeadingUnderscore);
    }
    if normalized.ends_with('_') {
        return Err(HandleValidationError::TrailingUnderscore);
    }
    if normalized.contains("__") {
        return Err(HandleValidationError::ConsecutiveUnderscores);
    }

    Ok(normalized)
}

/// `{valid, reason}` summary of a validation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Run every validation rule against raw input and summarize the result.
pub fn check(raw: &str) -> HandleCheck {
    match validate(raw) {
        Ok(()) => HandleCheck {
            valid: true,
            reason: None,
        },
        Err(err) => HandleCheck {
            valid: false,
            reason: Some(err.to_string()),
        },
    }
}

/// Canonical, validated handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    /// Normalize and validate raw input.
    pub fn parse(raw: &str) -> Result<Self, HandleValidationError> {
        canonicalize(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the handle is on the system deny-list.
    pub fn is_reserved(&self) -> bool {
        RESERVED_HANDLES.contains(&self.0.as_str())
    }

    pub fn storage_key(&self) -> String {
        reservation_key(self)
    }

    /// Recover the handle from a reservation storage key.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        key.strip_prefix(RESERVATION_KEY_PREFIX)
            .and_then(|raw| Self::parse(raw).ok())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Handle {
    type Err = HandleValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for Handle {
    type Error = HandleValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
