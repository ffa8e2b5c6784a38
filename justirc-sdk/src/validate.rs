//! Input validation and sanitization.
//!
//! Pure syntactic checks shared by client and server. Uniqueness and
//! authorization are enforced elsewhere.

use thiserror::Error;

/// Maximum message body size in bytes.
pub const MAX_MESSAGE_BYTES: usize = 4096;
/// Maximum topic length in characters.
pub const MAX_TOPIC_CHARS: usize = 256;
/// Maximum password length in characters.
pub const MAX_PASSWORD_CHARS: usize = 256;
/// Maximum kick/ban reason length in characters.
pub const MAX_REASON_CHARS: usize = 256;
/// Minimum account password length.
pub const MIN_PASSWORD_CHARS: usize = 8;
/// Minimum channel creator / operator password length.
pub const MIN_CREATOR_PASSWORD_CHARS: usize = 4;

/// Nicknames that can never be claimed.
const RESERVED_NICKNAMES: [&str; 4] = ["server", "admin", "root", "system"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("nickname must be 3-20 characters of letters, numbers, _ and -")]
    BadNickname,
    #[error("nickname {0:?} is reserved")]
    ReservedNickname(String),
    #[error("channel name must be # followed by 1-50 letters, numbers, _ and -")]
    BadChannelName,
    #[error("message must be 1-{MAX_MESSAGE_BYTES} bytes with no control characters")]
    BadMessage,
    #[error("invalid email address")]
    BadEmail,
    #[error("password must be {MIN_PASSWORD_CHARS}-{MAX_PASSWORD_CHARS} printable characters")]
    BadPassword,
    #[error("creator password must be at least {MIN_CREATOR_PASSWORD_CHARS} characters")]
    BadCreatorPassword,
    #[error("topic must be at most {MAX_TOPIC_CHARS} characters")]
    BadTopic,
    #[error("reason must be at most {MAX_REASON_CHARS} characters")]
    BadReason,
}

fn is_handle_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// 3-20 chars of `[A-Za-z0-9_-]`, reserved names rejected case-insensitively.
pub fn nickname(nick: &str) -> Result<(), ValidationError> {
    if nick.len() < 3 || nick.len() > 20 || !nick.chars().all(is_handle_char) {
        return Err(ValidationError::BadNickname);
    }
    let lower = nick.to_ascii_lowercase();
    if RESERVED_NICKNAMES.contains(&lower.as_str()) {
        return Err(ValidationError::ReservedNickname(nick.to_string()));
    }
    Ok(())
}

/// `#` followed by 1-50 chars of `[A-Za-z0-9_-]`.
pub fn channel_name(channel: &str) -> Result<(), ValidationError> {
    let Some(rest) = channel.strip_prefix('#') else {
        return Err(ValidationError::BadChannelName);
    };
    if rest.is_empty() || rest.len() > 50 || !rest.chars().all(is_handle_char) {
        return Err(ValidationError::BadChannelName);
    }
    Ok(())
}

/// Non-empty, at most 4096 bytes, no NUL, no control characters besides tab.
pub fn message_text(text: &str) -> Result<(), ValidationError> {
    if text.is_empty() || text.len() > MAX_MESSAGE_BYTES {
        return Err(ValidationError::BadMessage);
    }
    if text.chars().any(|c| c != '\t' && c.is_control()) {
        return Err(ValidationError::BadMessage);
    }
    Ok(())
}

/// RFC-lite email shape; `None` is always acceptable (email is optional).
pub fn email(email: Option<&str>) -> Result<(), ValidationError> {
    let Some(email) = email else { return Ok(()) };
    if email.is_empty() || email.len() > 254 {
        return Err(ValidationError::BadEmail);
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::BadEmail);
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let Some((_, tld)) = domain.rsplit_once('.') else {
        return Err(ValidationError::BadEmail);
    };
    let domain_ok = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && !domain.starts_with('.')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic());
    if local_ok && domain_ok {
        Ok(())
    } else {
        Err(ValidationError::BadEmail)
    }
}

/// Account password: 8-256 printable characters.
pub fn password(password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_CHARS || len > MAX_PASSWORD_CHARS {
        return Err(ValidationError::BadPassword);
    }
    Ok(())
}

/// Channel creator / operator password: at least 4 characters.
pub fn creator_password(password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if len < MIN_CREATOR_PASSWORD_CHARS || len > MAX_PASSWORD_CHARS {
        return Err(ValidationError::BadCreatorPassword);
    }
    Ok(())
}

pub fn topic(topic: &str) -> Result<(), ValidationError> {
    if topic.chars().count() > MAX_TOPIC_CHARS || topic.contains('\0') {
        return Err(ValidationError::BadTopic);
    }
    Ok(())
}

/// Kick/ban reason; empty is fine (reason is optional).
pub fn reason(reason: &str) -> Result<(), ValidationError> {
    if reason.chars().count() > MAX_REASON_CHARS || reason.contains('\0') {
        return Err(ValidationError::BadReason);
    }
    Ok(())
}

/// Strip control characters (tab survives), truncate to `max_chars`, trim.
pub fn sanitize(text: &str, max_chars: Option<usize>) -> String {
    let mut out: String = text.chars().filter(|c| !c.is_control() || *c == '\t').collect();
    if let Some(max) = max_chars {
        if out.chars().count() > max {
            out = out.chars().take(max).collect();
        }
    }
    out.trim().to_string()
}
