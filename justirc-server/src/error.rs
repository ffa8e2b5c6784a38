//! Server error taxonomy.
//!
//! Every client-visible failure is one of these kinds. The display string is
//! short and imperative, suitable for direct display; the stable `code`
//! enables client-side localization. Transport kinds close the connection;
//! all others are sent as a single `error` frame and the connection
//! continues.

use justirc_sdk::proto::Body;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    // ── Transport (close the connection) ────────────────────────────
    #[error("malformed frame")]
    MalformedFrame,
    #[error("message too large")]
    MessageTooLarge,
    #[error("read timed out")]
    ReadTimeout,
    #[error("connection lost")]
    ConnectionLost,

    // ── Registration ────────────────────────────────────────────────
    #[error("nickname {0} is already taken")]
    NicknameTaken(String),
    #[error("invalid nickname: {0}")]
    NicknameInvalid(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account locked, try again later")]
    AccountLocked,
    #[error("connections from this address are not allowed")]
    IpDenied,

    // ── Authorization ───────────────────────────────────────────────
    #[error("not authorized")]
    NotAuthorized,
    #[error("you are not in channel {0}")]
    NotInChannel(String),
    #[error("you are not an operator in {0}")]
    NotOperator(String),
    #[error("you are banned from {0}")]
    BannedFromChannel(String),

    // ── Resource ────────────────────────────────────────────────────
    #[error("rate limit exceeded, retry in {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },
    #[error("channel limit reached")]
    ChannelLimitReached,
    #[error("user limit reached")]
    UserLimitReached,

    // ── State ───────────────────────────────────────────────────────
    #[error("channel {0} not found")]
    ChannelNotFound(String),
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("no encryption key for {0}")]
    NoEncryptionKey(String),
    #[error("a transfer is already in progress")]
    TransferInProgress,
    #[error("incorrect channel password")]
    WrongChannelPassword,
    #[error("incorrect creator password")]
    WrongCreatorPassword,
}

impl ServerError {
    /// Stable machine-readable code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::MalformedFrame => "malformed_frame",
            ServerError::MessageTooLarge => "message_too_large",
            ServerError::ReadTimeout => "read_timeout",
            ServerError::ConnectionLost => "connection_lost",
            ServerError::NicknameTaken(_) => "nickname_taken",
            ServerError::NicknameInvalid(_) => "nickname_invalid",
            ServerError::AuthRequired => "auth_required",
            ServerError::InvalidCredentials => "invalid_credentials",
            ServerError::AccountLocked => "account_locked",
            ServerError::IpDenied => "ip_denied",
            ServerError::NotAuthorized => "not_authorized",
            ServerError::NotInChannel(_) => "not_in_channel",
            ServerError::NotOperator(_) => "not_operator",
            ServerError::BannedFromChannel(_) => "banned_from_channel",
            ServerError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ServerError::ChannelLimitReached => "channel_limit_reached",
            ServerError::UserLimitReached => "user_limit_reached",
            ServerError::ChannelNotFound(_) => "channel_not_found",
            ServerError::UserNotFound(_) => "user_not_found",
            ServerError::NoEncryptionKey(_) => "no_encryption_key",
            ServerError::TransferInProgress => "transfer_in_progress",
            ServerError::WrongChannelPassword => "wrong_channel_password",
            ServerError::WrongCreatorPassword => "wrong_creator_password",
        }
    }

    /// Protocol violations and transport failures end the connection.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ServerError::MalformedFrame
                | ServerError::MessageTooLarge
                | ServerError::ReadTimeout
                | ServerError::ConnectionLost
        )
    }

    /// The `error` frame for this failure.
    pub fn to_frame(&self) -> Body {
        let retry_after = match self {
            ServerError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        };
        Body::Error {
            code: self.code().to_string(),
            error: self.to_string(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_close() {
        assert!(ServerError::MalformedFrame.closes_connection());
        assert!(ServerError::MessageTooLarge.closes_connection());
        assert!(!ServerError::NotOperator("#x".into()).closes_connection());
        assert!(!ServerError::RateLimitExceeded { retry_after: 3 }.closes_connection());
    }

    #[test]
    fn rate_limit_frame_carries_retry_after() {
        let frame = ServerError::RateLimitExceeded { retry_after: 7 }.to_frame();
        match frame {
            Body::Error {
                code, retry_after, ..
            } => {
                assert_eq!(code, "rate_limit_exceeded");
                assert_eq!(retry_after, Some(7));
            }
            _ => panic!("expected error frame"),
        }
    }
}
