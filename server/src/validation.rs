//! Input validation for request data.
//!
//! Each validator returns the normalized value (where normalization applies)
//! or a [`ServerError::Validation`] describing the first problem found.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::error::{Result, ServerError};

/// Maximum length of an e-mail address (RFC 5321).
const MAX_EMAIL_LEN: usize = 254;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

/// Maximum length of a sanitized filename.
const MAX_FILENAME_LEN: usize = 255;

/// Maximum length of a LiveKit participant display name.
const MAX_PARTICIPANT_NAME_LEN: usize = 64;

const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?/~`";

const COMMON_PASSWORDS: &[&str] = &[
    "password",
    "123456",
    "12345678",
    "qwerty",
    "admin",
    "welcome",
    "password1",
    "abc123",
    "letmein",
    "monkey",
    "1234567",
    "12345",
    "111111",
    "1234",
    "dragon",
    "123123",
    "baseball",
    "football",
    "shadow",
    "master",
];

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

static ROOM_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{3,64}$").expect("valid room name regex"));

static UNSAFE_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w.-]").expect("valid filename regex"));

/// Validates an e-mail address and returns it trimmed and lowercased.
pub fn validate_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();

    if email.is_empty() {
        return Err(ServerError::validation("email is required"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(ServerError::validation("email is too long"));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(ServerError::validation("email format is invalid"));
    }

    Ok(email)
}

/// Checks password strength.
///
/// `username` is usually the e-mail address; its local part must not appear
/// in the password.
pub fn validate_password(password: &str, username: Option<&str>) -> Result<()> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(ServerError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(ServerError::validation(format!(
            "password must be at most {MAX_PASSWORD_LEN} characters"
        )));
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Err(ServerError::validation(
            "password must contain an uppercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err(ServerError::validation(
            "password must contain a lowercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ServerError::validation("password must contain a digit"));
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        return Err(ServerError::validation(
            "password must contain a special character",
        ));
    }

    let lowered = password.to_lowercase();
    if COMMON_PASSWORDS.contains(&lowered.as_str()) {
        return Err(ServerError::validation("password is too common"));
    }

    if let Some(username) = username {
        let local = username.split('@').next().unwrap_or_default().to_lowercase();
        if local.len() >= 3 && lowered.contains(&local) {
            return Err(ServerError::validation(
                "password must not contain the username",
            ));
        }
    }

    Ok(())
}

/// Trims `text` and checks its length in characters.
pub fn validate_text(text: &str, min: usize, max: usize, field: &str) -> Result<String> {
    let text = text.trim();
    let len = text.chars().count();

    if len < min {
        return Err(if min <= 1 {
            ServerError::validation(format!("{field} is required"))
        } else {
            ServerError::validation(format!("{field} must be at least {min} characters"))
        });
    }
    if len > max {
        return Err(ServerError::validation(format!(
            "{field} must be at most {max} characters"
        )));
    }

    Ok(text.to_string())
}

/// Replaces anything but word characters, dots and dashes with `_`.
///
/// Leading dots are stripped so the result can't address a parent directory
/// or a hidden file.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = UNSAFE_FILENAME_RE.replace_all(base, "_");
    let cleaned: String = cleaned
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILENAME_LEN)
        .collect();

    if cleaned.is_empty() {
        return Err(ServerError::validation("filename is invalid"));
    }

    Ok(cleaned)
}

pub fn validate_room_name(room: &str) -> Result<()> {
    if ROOM_NAME_RE.is_match(room) {
        Ok(())
    } else {
        Err(ServerError::validation(
            "room name must be 3-64 characters of letters, digits, '_' or '-'",
        ))
    }
}

pub fn validate_participant_name(name: &str) -> Result<String> {
    let name = validate_text(name, 1, MAX_PARTICIPANT_NAME_LEN, "participant name")?;
    if name.chars().any(char::is_control) {
        return Err(ServerError::validation(
            "participant name contains control characters",
        ));
    }
    Ok(name)
}
