//! Wire protocol: newline-delimited JSON frames.
//!
//! Every frame is a single JSON object on one line with a fixed envelope
//! (`version`, `type`, `timestamp`) plus type-specific fields. The message
//! type set is closed; unknown types fail to decode. Field order is not
//! significant. The `timestamp` is advisory only; consumers must tolerate
//! clock skew and never base security decisions on it.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default maximum size of a single frame in bytes. Oversize frames are a
/// protocol violation and close the connection.
pub const MAX_FRAME_BYTES: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// A user visible to other clients: routing id, handle, and identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub nickname: String,
    pub public_key: String,
}

/// A channel member as reported in a join acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: String,
    pub nickname: String,
    pub public_key: String,
    pub is_operator: bool,
}

/// The closed set of frame bodies. The serde tag is the wire `type` field.
///
/// Optional wire fields (`password`, `creator_password`, `session_token`, …)
/// are explicit `Option`s on their variants, never an untyped bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Register {
        nickname: String,
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    Disconnect,
    AuthRequired {
        message: String,
    },
    AuthRequest {
        username: String,
        password: String,
    },
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CreateAccount {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    ChangePassword {
        username: String,
        old_password: String,
        new_password: String,
    },
    PublicKeyRequest {
        target_nickname: String,
    },
    PublicKeyResponse {
        user_id: String,
        nickname: String,
        public_key: String,
    },
    /// Peer key exchange, or (with `channel` + ciphertext set) delivery of a
    /// symmetric channel key encrypted for one recipient. The server routes
    /// both forms without inspection.
    KeyExchange {
        from_id: String,
        to_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
    RekeyRequest {
        from_id: String,
        to_id: String,
        new_public_key: String,
    },
    RekeyResponse {
        from_id: String,
        to_id: String,
        new_public_key: String,
    },
    PrivateMessage {
        from_id: String,
        to_id: String,
        encrypted_data: String,
        nonce: String,
    },
    ChannelMessage {
        from_id: String,
        to_id: String,
        encrypted_data: String,
        nonce: String,
    },
    JoinChannel {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        creator_password: Option<String>,
    },
    LeaveChannel {
        channel: String,
    },
    SetTopic {
        channel: String,
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        set_by: Option<String>,
    },
    OpUser {
        channel: String,
        target_nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        granted_by: Option<String>,
    },
    KickUser {
        channel: String,
        target_nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kicked_by: Option<String>,
    },
    BanUser {
        channel: String,
        target_nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        banned_by: Option<String>,
    },
    UnbanUser {
        channel: String,
        target_nickname: String,
    },
    /// File transfer start. The display filename travels only inside
    /// `encrypted_data`; the envelope exposes nothing but sizes and an
    /// opaque transfer id.
    ImageStart {
        from_id: String,
        to_id: String,
        transfer_id: String,
        total_chunks: u64,
        file_size: u64,
        encrypted_data: String,
        nonce: String,
    },
    ImageChunk {
        from_id: String,
        to_id: String,
        transfer_id: String,
        chunk_number: u64,
        encrypted_data: String,
        nonce: String,
    },
    ImageEnd {
        from_id: String,
        to_id: String,
        transfer_id: String,
    },
    Ack {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        members: Option<Vec<MemberInfo>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_operator: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    Error {
        code: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    UserList {
        users: Vec<UserInfo>,
    },
    /// A user came online (no `channel`) or joined a channel we are in.
    UserJoined {
        user_id: String,
        nickname: String,
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    /// A user went offline (no `channel`) or left a channel we are in.
    UserLeft {
        user_id: String,
        nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl Body {
    /// Wire name of this frame type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Register { .. } => "register",
            Body::Disconnect => "disconnect",
            Body::AuthRequired { .. } => "auth_required",
            Body::AuthRequest { .. } => "auth_request",
            Body::AuthResponse { .. } => "auth_response",
            Body::CreateAccount { .. } => "create_account",
            Body::ChangePassword { .. } => "change_password",
            Body::PublicKeyRequest { .. } => "public_key_request",
            Body::PublicKeyResponse { .. } => "public_key_response",
            Body::KeyExchange { .. } => "key_exchange",
            Body::RekeyRequest { .. } => "rekey_request",
            Body::RekeyResponse { .. } => "rekey_response",
            Body::PrivateMessage { .. } => "private_message",
            Body::ChannelMessage { .. } => "channel_message",
            Body::JoinChannel { .. } => "join_channel",
            Body::LeaveChannel { .. } => "leave_channel",
            Body::SetTopic { .. } => "set_topic",
            Body::OpUser { .. } => "op_user",
            Body::KickUser { .. } => "kick_user",
            Body::BanUser { .. } => "ban_user",
            Body::UnbanUser { .. } => "unban_user",
            Body::ImageStart { .. } => "image_start",
            Body::ImageChunk { .. } => "image_chunk",
            Body::ImageEnd { .. } => "image_end",
            Body::Ack { .. } => "ack",
            Body::Error { .. } => "error",
            Body::UserList { .. } => "user_list",
            Body::UserJoined { .. } => "user_joined",
            Body::UserLeft { .. } => "user_left",
        }
    }
}

/// A complete wire frame: envelope plus body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub version: String,
    pub timestamp: f64,
    #[serde(flatten)]
    pub body: Body,
}

impl Frame {
    /// Wrap a body in a fresh envelope stamped with the current time.
    pub fn new(body: Body) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            version: PROTOCOL_VERSION.to_string(),
            timestamp,
            body,
        }
    }
}

/// Serialize a frame to a single line (no trailing newline).
pub fn encode(frame: &Frame) -> String {
    // Body is a plain data enum; serialization cannot fail.
    serde_json::to_string(frame).expect("frame serialization")
}

/// Parse one line into a frame.
pub fn decode(line: &str) -> Result<Frame, ProtoError> {
    let frame: Frame =
        serde_json::from_str(line).map_err(|e| ProtoError::MalformedFrame(e.to_string()))?;
    if frame.version != PROTOCOL_VERSION {
        return Err(ProtoError::MalformedFrame(format!(
            "unsupported version {:?}",
            frame.version
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_private_message() {
        let frame = Frame::new(Body::PrivateMessage {
            from_id: "user_0_alice".into(),
            to_id: "user_1_bob".into(),
            encrypted_data: "q83v".into(),
            nonce: "AAAAAAAAAAAAAAAA".into(),
        });
        let line = encode(&frame);
        let back = decode(&line).unwrap();
        assert_eq!(back.body, frame.body);
        assert_eq!(back.version, PROTOCOL_VERSION);
    }

    #[test]
    fn wire_type_tag_is_snake_case() {
        let line = encode(&Frame::new(Body::JoinChannel {
            channel: "#team".into(),
            password: None,
            creator_password: Some("creatorpw".into()),
        }));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "join_channel");
        assert_eq!(value["creator_password"], "creatorpw");
        // Absent options are omitted entirely, not serialized as null.
        assert!(value.get("password").is_none());
    }

    #[test]
    fn decode_tolerates_unknown_extra_fields() {
        let line = r##"{"version":"1.0","type":"leave_channel","channel":"#x","timestamp":1.5,"future_field":42}"##;
        let frame = decode(line).unwrap();
        assert_eq!(
            frame.body,
            Body::LeaveChannel {
                channel: "#x".into()
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let line = r#"{"version":"1.0","type":"warp_drive","timestamp":0.0}"#;
        assert!(decode(line).is_err());
    }

    #[test]
    fn decode_rejects_missing_mandatory_field() {
        // register without public_key
        let line = r#"{"version":"1.0","type":"register","nickname":"alice","timestamp":0.0}"#;
        assert!(decode(line).is_err());
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let line = r#"{"version":"2.0","type":"disconnect","timestamp":0.0}"#;
        assert!(decode(line).is_err());
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(decode("NICK alice").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn field_order_is_not_significant() {
        let a = r##"{"type":"set_topic","channel":"#a","topic":"hi","version":"1.0","timestamp":9.0}"##;
        let b = r##"{"version":"1.0","timestamp":9.0,"topic":"hi","channel":"#a","type":"set_topic"}"##;
        assert_eq!(decode(a).unwrap().body, decode(b).unwrap().body);
    }
}
