//! Per-client connection handler.
//!
//! Each TCP connection gets a reader loop plus a dedicated writer task
//! draining a bounded outbound queue. The handler walks the connection
//! through `Handshaking -> AwaitingAuth? -> Registered -> Active` and
//! dispatches frames by type:
//!
//! - [`registration`] - auth_request, create_account, change_password, register
//! - [`channel`] - join, leave, topic, op, kick, ban, unban
//! - [`messaging`] - encrypted routing: messages, key exchange, rekey, images
//!
//! The server never reads `encrypted_data` or `nonce`; routed frames are
//! forwarded with only the sender's canonical `from_id` rewritten.

mod channel;
mod messaging;
mod registration;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use justirc_sdk::proto::{self, Body, Frame};

use crate::error::ServerError;
use crate::rate::GateDecision;
use crate::server::SharedState;

/// High-water mark for a client's outbound queue.
const OUTBOUND_HIGH_WATER: usize = 256;
/// Minutes a source IP is banned after crossing the violation threshold.
const GATE_BAN_MINUTES: u64 = 15;

/// Bounded outbound queue with oldest-first shedding.
///
/// When a slow reader lets the queue exceed the high-water mark, the oldest
/// queued frames are dropped for that client only; writers never block and
/// unrelated clients are unaffected.
pub struct OutboundQueue {
    high_water: usize,
    inner: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(high_water: usize) -> Self {
        Self {
            high_water,
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one serialized line, shedding the oldest entry when full.
    pub fn push(&self, line: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.high_water {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(line);
        }
        self.notify.notify_one();
    }

    /// Wait for the next line; `None` once closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().unwrap();
                if let Some(line) = queue.pop_front() {
                    return Some(line);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn try_pop(&self) -> Option<String> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Frames shed due to backpressure, for the disconnect log line.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// State of a single client connection.
pub struct Connection {
    pub id: String,
    pub peer_ip: IpAddr,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    /// Account name once authenticated.
    pub account: Option<String>,
    /// Still gated behind mandatory authentication.
    pub awaiting_auth: bool,
}

impl Connection {
    fn new(id: String, peer_ip: IpAddr, awaiting_auth: bool) -> Self {
        Self {
            id,
            peer_ip,
            user_id: None,
            nickname: None,
            account: None,
            awaiting_auth,
        }
    }

    pub fn registered(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Whether the read loop keeps going after a frame.
enum Flow {
    Continue,
    Close,
}

fn encode_line(body: Body) -> String {
    let mut line = proto::encode(&Frame::new(body));
    line.push('\n');
    line
}

/// Handle one TCP connection from accept to cleanup.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = peer.to_string();
    let peer_ip = peer.ip();

    // IP filter and connection-rate gate come before anything else.
    let allowed = state.ipfilter.lock().unwrap().is_allowed(peer_ip);
    if !allowed {
        tracing::info!(%session_id, "Connection refused by IP filter");
        return reject(stream, ServerError::IpDenied).await;
    }
    let gate_decision = state.gate.lock().unwrap().check(peer_ip);
    match gate_decision {
        GateDecision::Allowed => {}
        GateDecision::Denied => {
            tracing::info!(%session_id, "Connection rate exceeded");
            return reject(stream, ServerError::RateLimitExceeded { retry_after: 60 }).await;
        }
        GateDecision::BanNow => {
            tracing::warn!(%session_id, "Connection-rate violations crossed threshold, temp-banning");
            state
                .ipfilter
                .lock()
                .unwrap()
                .temp_ban(peer_ip, GATE_BAN_MINUTES);
            return reject(stream, ServerError::IpDenied).await;
        }
    }

    tracing::info!(%session_id, "New connection");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, peer_ip, state).await
}

async fn reject(mut stream: TcpStream, error: ServerError) -> Result<()> {
    let line = encode_line(error.to_frame());
    let _ = stream.write_all(line.as_bytes()).await;
    let _ = stream.flush().await;
    Ok(())
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    session_id: String,
    peer_ip: IpAddr,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let queue = Arc::new(OutboundQueue::new(OUTBOUND_HIGH_WATER));

    // Writer task: drain the queue, batching writes between flushes.
    let write_queue = Arc::clone(&queue);
    let write_session_id = session_id.clone();
    let mut write_half = writer;
    let mut write_handle = tokio::spawn(async move {
        while let Some(line) = write_queue.pop().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                tracing::debug!(session_id = %write_session_id, "Write error: {e}");
                return;
            }
            let mut batched = 0;
            while let Some(queued) = write_queue.try_pop() {
                if let Err(e) = write_half.write_all(queued.as_bytes()).await {
                    tracing::debug!(session_id = %write_session_id, "Write error: {e}");
                    return;
                }
                batched += 1;
                if batched >= 64 {
                    break;
                }
            }
            if let Err(e) = write_half.flush().await {
                tracing::debug!(session_id = %write_session_id, "Flush error: {e}");
                return;
            }
        }
    });

    let require_auth = state.config.require_authentication;
    let mut conn = Connection::new(session_id.clone(), peer_ip, require_auth);
    if require_auth {
        queue.push(encode_line(Body::AuthRequired {
            message: "Authentication required".to_string(),
        }));
    }

    let read_timeout = Duration::from_secs(state.config.read_timeout.max(1));
    let idle_limit = Duration::from_secs(state.config.connection_timeout.max(1));
    let max_frame = state.config.max_message_size;

    let mut line = String::new();
    let mut idle = Duration::ZERO;
    loop {
        line.clear();
        let read = tokio::time::timeout(read_timeout, reader.read_line(&mut line)).await;
        match read {
            Err(_) => {
                idle += read_timeout;
                if idle >= idle_limit {
                    tracing::info!(%session_id, "Idle timeout");
                    break;
                }
                continue;
            }
            Ok(Ok(0)) | Ok(Err(_)) => break, // EOF or transport error
            Ok(Ok(_)) => idle = Duration::ZERO,
        }

        if line.len() > max_frame {
            tracing::warn!(%session_id, len = line.len(), "Oversize frame");
            queue.push(encode_line(ServerError::MessageTooLarge.to_frame()));
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame = match proto::decode(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%session_id, "Malformed frame: {e}");
                queue.push(encode_line(ServerError::MalformedFrame.to_frame()));
                break;
            }
        };

        if let Some(ref user_id) = conn.user_id {
            state.sessions.lock().unwrap().touch(user_id);
        }

        match dispatch(&mut conn, frame.body, &state, &queue) {
            Flow::Continue => {}
            Flow::Close => break,
        }
    }

    cleanup(&conn, &state, &queue);
    // Closing the queue lets the writer drain the final frames (a goodbye
    // error, departure notices) and exit; a wedged peer gets cut off.
    if tokio::time::timeout(Duration::from_secs(5), &mut write_handle)
        .await
        .is_err()
    {
        write_handle.abort();
    }
    Ok(())
}

fn dispatch(
    conn: &mut Connection,
    body: Body,
    state: &Arc<SharedState>,
    queue: &Arc<OutboundQueue>,
) -> Flow {
    if !conn.registered() {
        return registration::dispatch_preregistration(conn, body, state, queue);
    }
    match body {
        Body::PrivateMessage {
            to_id,
            encrypted_data,
            nonce,
            ..
        } => messaging::route_private(conn, &to_id, encrypted_data, nonce, state),
        Body::ChannelMessage {
            to_id,
            encrypted_data,
            nonce,
            ..
        } => messaging::route_channel(conn, &to_id, encrypted_data, nonce, state),
        Body::KeyExchange {
            to_id,
            public_key,
            channel,
            encrypted_data,
            nonce,
            ..
        } => messaging::route_key_exchange(
            conn,
            &to_id,
            public_key,
            channel,
            encrypted_data,
            nonce,
            state,
        ),
        Body::RekeyRequest {
            to_id,
            new_public_key,
            ..
        } => messaging::route_rekey(conn, &to_id, new_public_key, true, state),
        Body::RekeyResponse {
            to_id,
            new_public_key,
            ..
        } => messaging::route_rekey(conn, &to_id, new_public_key, false, state),
        Body::PublicKeyRequest { target_nickname } => {
            messaging::public_key_request(conn, &target_nickname, state)
        }
        Body::ImageStart {
            to_id,
            transfer_id,
            total_chunks,
            file_size,
            encrypted_data,
            nonce,
            ..
        } => messaging::route_image_start(
            conn,
            &to_id,
            transfer_id,
            total_chunks,
            file_size,
            encrypted_data,
            nonce,
            state,
        ),
        Body::ImageChunk {
            to_id,
            transfer_id,
            chunk_number,
            encrypted_data,
            nonce,
            ..
        } => messaging::route_image_chunk(
            conn,
            &to_id,
            transfer_id,
            chunk_number,
            encrypted_data,
            nonce,
            state,
        ),
        Body::ImageEnd {
            to_id, transfer_id, ..
        } => messaging::route_image_end(conn, &to_id, transfer_id, state),
        Body::JoinChannel {
            channel,
            password,
            creator_password,
        } => channel::handle_join(conn, &channel, password, creator_password, state),
        Body::LeaveChannel { channel } => channel::handle_leave(conn, &channel, state),
        Body::SetTopic { channel, topic, .. } => {
            channel::handle_topic(conn, &channel, &topic, state)
        }
        Body::OpUser {
            channel,
            target_nickname,
            op_password,
            ..
        } => channel::handle_op(conn, &channel, &target_nickname, op_password, state),
        Body::KickUser {
            channel,
            target_nickname,
            reason,
            duration_secs,
            ..
        } => channel::handle_kick(
            conn,
            &channel,
            &target_nickname,
            reason,
            duration_secs,
            state,
        ),
        Body::BanUser {
            channel,
            target_nickname,
            duration_secs,
            ..
        } => channel::handle_ban(conn, &channel, &target_nickname, duration_secs, state),
        Body::UnbanUser {
            channel,
            target_nickname,
        } => channel::handle_unban(conn, &channel, &target_nickname, state),
        Body::ChangePassword {
            username,
            old_password,
            new_password,
        } => registration::handle_change_password(
            conn,
            &username,
            &old_password,
            &new_password,
            state,
            queue,
        ),
        Body::Disconnect => Flow::Close,
        Body::Register { .. } => {
            send_error(conn, state, ServerError::NotAuthorized);
            Flow::Continue
        }
        other => {
            tracing::debug!(conn = %conn.id, frame = other.type_name(), "Ignoring frame");
            Flow::Continue
        }
    }
}

/// Send a typed error to this connection's own queue.
fn send_error(conn: &Connection, state: &Arc<SharedState>, error: ServerError) {
    if let Some(ref user_id) = conn.user_id {
        state.send_to(user_id, error.to_frame());
    }
}

/// Remove the user from the session table and every channel, then tell the
/// world. Stored operator passwords survive for reclaim on rejoin.
fn cleanup(conn: &Connection, state: &Arc<SharedState>, queue: &Arc<OutboundQueue>) {
    queue.close();
    let Some(ref user_id) = conn.user_id else {
        tracing::info!(conn = %conn.id, "Connection closed (unregistered)");
        return;
    };

    let entry = state.sessions.lock().unwrap().remove(user_id);
    let Some(entry) = entry else {
        return;
    };
    let left_channels = state.registry.lock().unwrap().remove_user_everywhere(user_id);
    state.rates.lock().unwrap().forget(user_id);

    for channel in &left_channels {
        state.broadcast_channel(
            channel,
            Some(user_id),
            Body::UserLeft {
                user_id: user_id.clone(),
                nickname: entry.nickname.clone(),
                channel: Some(channel.clone()),
            },
        );
    }
    state.broadcast_all(
        Some(user_id),
        Body::UserLeft {
            user_id: user_id.clone(),
            nickname: entry.nickname.clone(),
            channel: None,
        },
    );

    tracing::info!(
        conn = %conn.id,
        nickname = %entry.nickname,
        shed = queue.dropped(),
        "Connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_queue_delivers_in_order() {
        let queue = OutboundQueue::new(8);
        queue.push("a\n".into());
        queue.push("b\n".into());
        assert_eq!(queue.pop().await.as_deref(), Some("a\n"));
        assert_eq!(queue.pop().await.as_deref(), Some("b\n"));
    }

    #[tokio::test]
    async fn outbound_queue_sheds_oldest() {
        let queue = OutboundQueue::new(2);
        queue.push("one\n".into());
        queue.push("two\n".into());
        queue.push("three\n".into());
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await.as_deref(), Some("two\n"));
        assert_eq!(queue.pop().await.as_deref(), Some("three\n"));
    }

    #[tokio::test]
    async fn outbound_queue_close_drains_then_ends() {
        let queue = OutboundQueue::new(8);
        queue.push("last\n".into());
        queue.close();
        assert_eq!(queue.pop().await.as_deref(), Some("last\n"));
        assert_eq!(queue.pop().await, None);
        // Pushes after close are dropped.
        queue.push("late\n".into());
        assert_eq!(queue.pop().await, None);
    }
}
