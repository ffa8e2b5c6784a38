//! Events emitted by the client for the UI layer to consume.

use crate::proto::UserInfo;
use crate::transfer::FileMetadata;

/// Events that the SDK emits to the consumer (TUI, GUI, bot, tests).
#[derive(Debug, Clone)]
pub enum Event {
    /// Registration complete; `user_id` is our server-assigned identity.
    Registered { user_id: String, nickname: String },

    /// The server requires authentication before registration.
    AuthRequired { message: String },

    /// Result of an `auth_request` or `create_account`.
    AuthResult {
        success: bool,
        session_token: Option<String>,
        message: Option<String>,
    },

    /// Initial roster or a user coming online.
    UserOnline { user: UserInfo },

    /// A user disconnected from the server.
    UserOffline { user_id: String, nickname: String },

    /// We joined a channel.
    JoinedChannel {
        channel: String,
        is_operator: bool,
        topic: Option<String>,
        member_count: usize,
    },

    /// Another user joined a channel we are in.
    PeerJoinedChannel { channel: String, nickname: String },

    /// Another user left a channel we are in.
    PeerLeftChannel { channel: String, nickname: String },

    /// A decrypted private message.
    PrivateMessage { from: String, text: String },

    /// A decrypted channel message.
    ChannelMessage {
        channel: String,
        from: String,
        text: String,
    },

    /// A channel message that could not be decrypted (no key yet, or a
    /// key mismatch). The body is not recoverable.
    UndecryptableMessage { channel: Option<String>, from: String },

    /// Channel topic changed.
    TopicChanged {
        channel: String,
        topic: String,
        set_by: Option<String>,
    },

    /// We were kicked from a channel.
    Kicked {
        channel: String,
        by: Option<String>,
        reason: Option<String>,
    },

    /// Someone (possibly us) was granted operator status.
    Opped { channel: String, nickname: String },

    /// A key rotation with a peer completed.
    KeysRotated { peer_nickname: String },

    /// An inbound file transfer started.
    FileOffered {
        from: String,
        metadata: FileMetadata,
    },

    /// Progress on an inbound transfer, in `[0, 1]`.
    FileProgress { from: String, progress: f64 },

    /// An inbound transfer completed and verified.
    FileReceived {
        from: String,
        metadata: FileMetadata,
        bytes: Vec<u8>,
    },

    /// The server reported an error.
    ServerError {
        code: String,
        message: String,
        retry_after: Option<u64>,
    },

    /// Connection closed.
    Disconnected { reason: String },
}
