//! Encrypted routing: private and channel messages, key exchange, rekey,
//! and file-transfer frames.
//!
//! Nothing here reads `encrypted_data` or `nonce`. Routed frames are
//! forwarded byte-for-byte in those fields; only `from_id` is rewritten to
//! the sender's canonical id so a client cannot spoof its origin.

use std::sync::Arc;

use justirc_sdk::proto::Body;

use super::{send_error, Connection, Flow};
use crate::error::ServerError;
use crate::rate::{RateDecision, RateKind};
use crate::server::SharedState;

fn self_id(conn: &Connection) -> &str {
    conn.user_id.as_deref().expect("active connection has a user_id")
}

/// Consume one token from the sender's bucket, or tell them to back off.
fn check_rate(conn: &Connection, kind: RateKind, state: &Arc<SharedState>) -> bool {
    let decision = state.rates.lock().unwrap().check(self_id(conn), kind);
    match decision {
        RateDecision::Allowed => true,
        RateDecision::DeniedFor(retry_after) => {
            send_error(conn, state, ServerError::RateLimitExceeded { retry_after });
            false
        }
    }
}

fn recipient_exists(to_id: &str, state: &Arc<SharedState>) -> bool {
    state.sessions.lock().unwrap().get(to_id).is_some()
}

pub(super) fn route_private(
    conn: &Connection,
    to_id: &str,
    encrypted_data: String,
    nonce: String,
    state: &Arc<SharedState>,
) -> Flow {
    if !check_rate(conn, RateKind::Message, state) {
        return Flow::Continue;
    }
    if !recipient_exists(to_id, state) {
        send_error(conn, state, ServerError::UserNotFound(to_id.to_string()));
        return Flow::Continue;
    }
    state.send_to(
        to_id,
        Body::PrivateMessage {
            from_id: self_id(conn).to_string(),
            to_id: to_id.to_string(),
            encrypted_data,
            nonce,
        },
    );
    Flow::Continue
}

pub(super) fn route_channel(
    conn: &Connection,
    channel: &str,
    encrypted_data: String,
    nonce: String,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    if !state.registry.lock().unwrap().is_member(user_id, channel) {
        send_error(conn, state, ServerError::NotInChannel(channel.to_string()));
        return Flow::Continue;
    }
    if !check_rate(conn, RateKind::Message, state) {
        return Flow::Continue;
    }
    state.broadcast_channel(
        channel,
        Some(user_id),
        Body::ChannelMessage {
            from_id: user_id.to_string(),
            to_id: channel.to_string(),
            encrypted_data,
            nonce,
        },
    );
    Flow::Continue
}

pub(super) fn route_key_exchange(
    conn: &Connection,
    to_id: &str,
    public_key: Option<String>,
    channel: Option<String>,
    encrypted_data: Option<String>,
    nonce: Option<String>,
    state: &Arc<SharedState>,
) -> Flow {
    if !recipient_exists(to_id, state) {
        send_error(conn, state, ServerError::UserNotFound(to_id.to_string()));
        return Flow::Continue;
    }
    state.send_to(
        to_id,
        Body::KeyExchange {
            from_id: self_id(conn).to_string(),
            to_id: to_id.to_string(),
            public_key,
            channel,
            encrypted_data,
            nonce,
        },
    );
    Flow::Continue
}

pub(super) fn route_rekey(
    conn: &Connection,
    to_id: &str,
    new_public_key: String,
    is_request: bool,
    state: &Arc<SharedState>,
) -> Flow {
    if !recipient_exists(to_id, state) {
        send_error(conn, state, ServerError::UserNotFound(to_id.to_string()));
        return Flow::Continue;
    }
    let from_id = self_id(conn).to_string();
    let body = if is_request {
        Body::RekeyRequest {
            from_id,
            to_id: to_id.to_string(),
            new_public_key,
        }
    } else {
        Body::RekeyResponse {
            from_id,
            to_id: to_id.to_string(),
            new_public_key,
        }
    };
    state.send_to(to_id, body);
    Flow::Continue
}

pub(super) fn public_key_request(
    conn: &Connection,
    target_nickname: &str,
    state: &Arc<SharedState>,
) -> Flow {
    let response = {
        let sessions = state.sessions.lock().unwrap();
        sessions
            .id_by_nick(target_nickname)
            .and_then(|id| sessions.get(id))
            .map(|entry| Body::PublicKeyResponse {
                user_id: entry.user_id.clone(),
                nickname: entry.nickname.clone(),
                public_key: entry.public_key.clone(),
            })
    };
    match response {
        Some(body) => state.send_to(self_id(conn), body),
        None => send_error(
            conn,
            state,
            ServerError::UserNotFound(target_nickname.to_string()),
        ),
    }
    Flow::Continue
}

pub(super) fn route_image_start(
    conn: &Connection,
    to_id: &str,
    transfer_id: String,
    total_chunks: u64,
    file_size: u64,
    encrypted_data: String,
    nonce: String,
    state: &Arc<SharedState>,
) -> Flow {
    if !recipient_exists(to_id, state) {
        send_error(conn, state, ServerError::UserNotFound(to_id.to_string()));
        return Flow::Continue;
    }
    state.send_to(
        to_id,
        Body::ImageStart {
            from_id: self_id(conn).to_string(),
            to_id: to_id.to_string(),
            transfer_id,
            total_chunks,
            file_size,
            encrypted_data,
            nonce,
        },
    );
    Flow::Continue
}

pub(super) fn route_image_chunk(
    conn: &Connection,
    to_id: &str,
    transfer_id: String,
    chunk_number: u64,
    encrypted_data: String,
    nonce: String,
    state: &Arc<SharedState>,
) -> Flow {
    if !check_rate(conn, RateKind::ImageChunk, state) {
        return Flow::Continue;
    }
    if !recipient_exists(to_id, state) {
        send_error(conn, state, ServerError::UserNotFound(to_id.to_string()));
        return Flow::Continue;
    }
    state.send_to(
        to_id,
        Body::ImageChunk {
            from_id: self_id(conn).to_string(),
            to_id: to_id.to_string(),
            transfer_id,
            chunk_number,
            encrypted_data,
            nonce,
        },
    );
    Flow::Continue
}

pub(super) fn route_image_end(
    conn: &Connection,
    to_id: &str,
    transfer_id: String,
    state: &Arc<SharedState>,
) -> Flow {
    if !recipient_exists(to_id, state) {
        send_error(conn, state, ServerError::UserNotFound(to_id.to_string()));
        return Flow::Continue;
    }
    state.send_to(
        to_id,
        Body::ImageEnd {
            from_id: self_id(conn).to_string(),
            to_id: to_id.to_string(),
            transfer_id,
        },
    );
    Flow::Continue
}
