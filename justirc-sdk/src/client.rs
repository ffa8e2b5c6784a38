//! Async client driving one server connection.
//!
//! The client owns all cryptographic state for the connection: the identity
//! keypair, per-peer sessions, channel keys, and in-flight file transfers.
//! Consumers talk to it through a [`ClientHandle`] and receive [`Event`]s on
//! an mpsc channel.
//!
//! The client does not reconnect automatically. Listen for
//! [`Event::Disconnected`] and build your own backoff.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::crypto::{ChannelCrypto, CryptoCore, Rotation, RotationPolicy};
use crate::event::Event;
use crate::proto::{self, Body, Frame, UserInfo};
use crate::transfer::{InboundTransfers, OutboundTransfer};
use crate::validate;

/// Configuration for connecting to a server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nickname: String,
    /// Account credentials; when set the client authenticates before
    /// registering (required on servers with mandatory authentication).
    pub username: Option<String>,
    pub password: Option<String>,
    /// Rekey thresholds for peer sessions.
    pub rotation: RotationPolicy,
    /// Pace file chunks: sleep `pace_window` after every `pace_chunks`
    /// chunks so the sender stays inside the server's image-chunk budget.
    pub pace_chunks: u64,
    pub pace_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nickname: "user".to_string(),
            username: None,
            password: None,
            rotation: RotationPolicy::default(),
            pace_chunks: 90,
            pace_window: Duration::from_secs(10),
        }
    }
}

/// Commands the consumer can send to the client task.
#[derive(Debug)]
pub enum Command {
    PrivateMessage { to_nickname: String, text: String },
    ChannelMessage { channel: String, text: String },
    Join {
        channel: String,
        password: Option<String>,
        creator_password: Option<String>,
    },
    Leave { channel: String },
    SetTopic { channel: String, topic: String },
    Op {
        channel: String,
        nickname: String,
        op_password: String,
    },
    Kick {
        channel: String,
        nickname: String,
        reason: Option<String>,
    },
    Ban { channel: String, nickname: String },
    Unban { channel: String, nickname: String },
    Rekey { nickname: String },
    SendFile {
        to_nickname: String,
        filename: String,
        bytes: Vec<u8>,
    },
    Authenticate {
        username: String,
        password: String,
    },
    CreateAccount {
        username: String,
        password: String,
        email: Option<String>,
    },
    ChangePassword {
        username: String,
        old_password: String,
        new_password: String,
    },
    Quit,
}

/// Handle to a running client connection.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.context("client task gone")
    }

    pub async fn private_message(&self, to_nickname: &str, text: &str) -> Result<()> {
        self.send(Command::PrivateMessage {
            to_nickname: to_nickname.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn channel_message(&self, channel: &str, text: &str) -> Result<()> {
        self.send(Command::ChannelMessage {
            channel: channel.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn join(
        &self,
        channel: &str,
        password: Option<&str>,
        creator_password: Option<&str>,
    ) -> Result<()> {
        self.send(Command::Join {
            channel: channel.to_string(),
            password: password.map(str::to_string),
            creator_password: creator_password.map(str::to_string),
        })
        .await
    }

    pub async fn leave(&self, channel: &str) -> Result<()> {
        self.send(Command::Leave {
            channel: channel.to_string(),
        })
        .await
    }

    pub async fn set_topic(&self, channel: &str, topic: &str) -> Result<()> {
        self.send(Command::SetTopic {
            channel: channel.to_string(),
            topic: topic.to_string(),
        })
        .await
    }

    pub async fn op(&self, channel: &str, nickname: &str, op_password: &str) -> Result<()> {
        self.send(Command::Op {
            channel: channel.to_string(),
            nickname: nickname.to_string(),
            op_password: op_password.to_string(),
        })
        .await
    }

    pub async fn kick(&self, channel: &str, nickname: &str, reason: Option<&str>) -> Result<()> {
        self.send(Command::Kick {
            channel: channel.to_string(),
            nickname: nickname.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    pub async fn ban(&self, channel: &str, nickname: &str) -> Result<()> {
        self.send(Command::Ban {
            channel: channel.to_string(),
            nickname: nickname.to_string(),
        })
        .await
    }

    pub async fn unban(&self, channel: &str, nickname: &str) -> Result<()> {
        self.send(Command::Unban {
            channel: channel.to_string(),
            nickname: nickname.to_string(),
        })
        .await
    }

    /// Rotate encryption keys with a peer now.
    pub async fn rekey(&self, nickname: &str) -> Result<()> {
        self.send(Command::Rekey {
            nickname: nickname.to_string(),
        })
        .await
    }

    pub async fn send_file(&self, to_nickname: &str, filename: &str, bytes: Vec<u8>) -> Result<()> {
        self.send(Command::SendFile {
            to_nickname: to_nickname.to_string(),
            filename: filename.to_string(),
            bytes,
        })
        .await
    }

    /// Authenticate against an existing account; on success the client
    /// registers automatically with the minted session token.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        self.send(Command::Authenticate {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<()> {
        self.send(Command::CreateAccount {
            username: username.to_string(),
            password: password.to_string(),
            email: email.map(str::to_string),
        })
        .await
    }

    pub async fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        self.send(Command::ChangePassword {
            username: username.to_string(),
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        })
        .await
    }

    pub async fn quit(&self) -> Result<()> {
        self.send(Command::Quit).await
    }
}

/// Connect, spawn the client task, and return a handle plus the event stream.
pub async fn connect(config: ClientConfig) -> Result<(ClientHandle, mpsc::Receiver<Event>)> {
    let stream = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("connecting to {}", config.server_addr))?;
    let (read_half, write_half) = stream.into_split();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);

    let task = ClientTask::new(config, write_half, event_tx);
    tokio::spawn(task.run(BufReader::new(read_half), cmd_rx));

    Ok((ClientHandle { cmd_tx }, event_rx))
}

struct ClientTask {
    config: ClientConfig,
    writer: OwnedWriteHalf,
    events: mpsc::Sender<Event>,

    crypto: CryptoCore,
    channels: ChannelCrypto,
    inbound: InboundTransfers,

    user_id: Option<String>,
    session_token: Option<String>,
    /// user_id -> roster entry.
    users: HashMap<String, UserInfo>,
    /// nickname -> user_id.
    by_nick: HashMap<String, String>,
    /// Channels we are in, with our operator flag.
    joined: HashMap<String, bool>,
    /// Peers with a rekey handshake in flight (we sent the request).
    rekey_pending: HashSet<String>,
}

impl ClientTask {
    fn new(config: ClientConfig, writer: OwnedWriteHalf, events: mpsc::Sender<Event>) -> Self {
        let crypto = CryptoCore::with_policy(config.rotation.clone());
        Self {
            config,
            writer,
            events,
            crypto,
            channels: ChannelCrypto::new(),
            inbound: InboundTransfers::new(),
            user_id: None,
            session_token: None,
            users: HashMap::new(),
            by_nick: HashMap::new(),
            joined: HashMap::new(),
            rekey_pending: HashSet::new(),
        }
    }

    async fn run(mut self, reader: BufReader<OwnedReadHalf>, mut cmd_rx: mpsc::Receiver<Command>) {
        if let Err(e) = self.open_session().await {
            tracing::warn!("Failed to open session: {e}");
            let _ = self
                .events
                .send(Event::Disconnected {
                    reason: e.to_string(),
                })
                .await;
            return;
        }

        // A dedicated reader task feeds complete lines over a channel;
        // selecting on channel receives never loses a partial read.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut reader = reader;
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if line_tx.send(line.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let reason = loop {
            tokio::select! {
                maybe_line = line_rx.recv() => {
                    let Some(line) = maybe_line else {
                        break "server closed the connection".to_string();
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match proto::decode(trimmed) {
                        Ok(frame) => {
                            if let Err(e) = self.handle_frame(frame.body).await {
                                tracing::warn!("Frame handling failed: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("Undecodable frame from server: {e}"),
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Quit) => {
                            let _ = self.send_frame(Body::Disconnect).await;
                            break "quit".to_string();
                        }
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                tracing::warn!("Command failed: {e}");
                            }
                        }
                    }
                }
            }
        };

        let _ = self.events.send(Event::Disconnected { reason }).await;
    }

    /// Authenticate if credentials are configured, then register.
    async fn open_session(&mut self) -> Result<()> {
        if let (Some(username), Some(password)) = (
            self.config.username.clone(),
            self.config.password.clone(),
        ) {
            self.send_frame(Body::AuthRequest { username, password }).await?;
        } else {
            self.send_register().await?;
        }
        Ok(())
    }

    async fn send_register(&mut self) -> Result<()> {
        self.send_frame(Body::Register {
            nickname: self.config.nickname.clone(),
            public_key: self.crypto.public_key_b64(),
            session_token: self.session_token.clone(),
        })
        .await
    }

    async fn send_frame(&mut self, body: Body) -> Result<()> {
        let mut line = proto::encode(&Frame::new(body));
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    fn my_id(&self) -> String {
        self.user_id.clone().unwrap_or_default()
    }

    fn nickname_of(&self, user_id: &str) -> String {
        self.users
            .get(user_id)
            .map(|u| u.nickname.clone())
            .unwrap_or_else(|| user_id.to_string())
    }

    fn learn_user(&mut self, user: UserInfo) {
        if Some(user.user_id.as_str()) == self.user_id.as_deref() {
            return;
        }
        // Installing replaces any stale session for a reconnected peer.
        if let Err(e) = self.crypto.install_peer(&user.user_id, &user.public_key) {
            tracing::warn!(user_id = %user.user_id, "Rejecting peer public key: {e}");
            return;
        }
        self.by_nick.insert(user.nickname.clone(), user.user_id.clone());
        self.users.insert(user.user_id.clone(), user);
    }

    async fn handle_frame(&mut self, body: Body) -> Result<()> {
        match body {
            Body::AuthRequired { message } => {
                self.emit(Event::AuthRequired { message }).await;
            }
            Body::AuthResponse {
                success,
                session_token,
                message,
            } => {
                if success {
                    self.session_token = session_token.clone();
                    self.send_register().await?;
                }
                self.emit(Event::AuthResult {
                    success,
                    session_token,
                    message,
                })
                .await;
            }
            Body::Ack {
                user_id: Some(user_id),
                ..
            } => {
                self.user_id = Some(user_id.clone());
                self.emit(Event::Registered {
                    user_id,
                    nickname: self.config.nickname.clone(),
                })
                .await;
            }
            Body::Ack {
                channel: Some(channel),
                members,
                is_operator,
                topic,
                ..
            } => {
                let members = members.unwrap_or_default();
                let is_operator = is_operator.unwrap_or(false);
                for member in &members {
                    self.learn_user(UserInfo {
                        user_id: member.user_id.clone(),
                        nickname: member.nickname.clone(),
                        public_key: member.public_key.clone(),
                    });
                }
                // First joiner creates the channel key; later joiners wait
                // for a key_exchange delivery from a member that holds it.
                if members.len() <= 1 && !self.channels.has_channel_key(&channel) {
                    self.channels.create_channel_key(&channel);
                }
                self.joined.insert(channel.clone(), is_operator);
                self.emit(Event::JoinedChannel {
                    channel,
                    is_operator,
                    topic,
                    member_count: members.len(),
                })
                .await;
            }
            Body::Ack { .. } => {}
            Body::UserList { users } => {
                for user in users {
                    self.learn_user(user.clone());
                    self.emit(Event::UserOnline { user }).await;
                }
            }
            Body::UserJoined {
                user_id,
                nickname,
                public_key,
                channel,
            } => {
                self.learn_user(UserInfo {
                    user_id: user_id.clone(),
                    nickname: nickname.clone(),
                    public_key,
                });
                match channel {
                    Some(channel) => {
                        self.offer_channel_key(&channel, &user_id).await?;
                        self.emit(Event::PeerJoinedChannel { channel, nickname }).await;
                    }
                    None => {
                        if let Some(user) = self.users.get(&user_id).cloned() {
                            self.emit(Event::UserOnline { user }).await;
                        }
                    }
                }
            }
            Body::UserLeft {
                user_id,
                nickname,
                channel,
            } => match channel {
                Some(channel) => {
                    self.emit(Event::PeerLeftChannel { channel, nickname }).await;
                }
                None => {
                    self.by_nick.remove(&nickname);
                    self.users.remove(&user_id);
                    self.crypto.remove_peer(&user_id);
                    self.inbound.cancel(&user_id);
                    self.emit(Event::UserOffline { user_id, nickname }).await;
                }
            },
            Body::PublicKeyResponse {
                user_id,
                nickname,
                public_key,
            } => {
                self.learn_user(UserInfo {
                    user_id,
                    nickname,
                    public_key,
                });
            }
            Body::KeyExchange {
                from_id,
                public_key,
                channel,
                encrypted_data,
                nonce,
                ..
            } => {
                if let Some(public_key) = public_key {
                    if let Err(e) = self.crypto.install_peer(&from_id, &public_key) {
                        tracing::warn!(%from_id, "Rejecting exchanged key: {e}");
                    }
                } else if let (Some(channel), Some(encrypted_data), Some(nonce)) =
                    (channel, encrypted_data, nonce)
                {
                    let key = self.crypto.decrypt(&from_id, &encrypted_data, &nonce)?;
                    let key_b64 = String::from_utf8(key).unwrap_or_default();
                    if !self.channels.install_channel_key(&channel, &key_b64)? {
                        tracing::warn!(%channel, "Conflicting channel key delivery ignored");
                    }
                }
            }
            Body::RekeyRequest {
                from_id,
                new_public_key,
                ..
            } => {
                // Answer with a fresh key of our own, then switch.
                let ours = self.crypto.begin_rotation(&from_id)?;
                let my_id = self.my_id();
                self.send_frame(Body::RekeyResponse {
                    from_id: my_id,
                    to_id: from_id.clone(),
                    new_public_key: ours,
                })
                .await?;
                self.crypto.complete_rotation(&from_id, &new_public_key)?;
                self.emit(Event::KeysRotated {
                    peer_nickname: self.nickname_of(&from_id),
                })
                .await;
            }
            Body::RekeyResponse {
                from_id,
                new_public_key,
                ..
            } => {
                self.crypto.complete_rotation(&from_id, &new_public_key)?;
                self.rekey_pending.remove(&from_id);
                self.emit(Event::KeysRotated {
                    peer_nickname: self.nickname_of(&from_id),
                })
                .await;
            }
            Body::PrivateMessage {
                from_id,
                encrypted_data,
                nonce,
                ..
            } => match self.crypto.decrypt(&from_id, &encrypted_data, &nonce) {
                Ok(plaintext) => {
                    self.emit(Event::PrivateMessage {
                        from: self.nickname_of(&from_id),
                        text: String::from_utf8_lossy(&plaintext).into_owned(),
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(%from_id, "Failed to decrypt private message: {e}");
                    self.emit(Event::UndecryptableMessage {
                        channel: None,
                        from: self.nickname_of(&from_id),
                    })
                    .await;
                }
            },
            Body::ChannelMessage {
                from_id,
                to_id: channel,
                encrypted_data,
                nonce,
                ..
            } => match self.channels.decrypt_channel(&channel, &encrypted_data, &nonce) {
                Ok(plaintext) => {
                    self.emit(Event::ChannelMessage {
                        channel,
                        from: self.nickname_of(&from_id),
                        text: String::from_utf8_lossy(&plaintext).into_owned(),
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(%channel, "Failed to decrypt channel message: {e}");
                    self.emit(Event::UndecryptableMessage {
                        channel: Some(channel),
                        from: self.nickname_of(&from_id),
                    })
                    .await;
                }
            },
            Body::SetTopic {
                channel,
                topic,
                set_by,
            } => {
                self.emit(Event::TopicChanged {
                    channel,
                    topic,
                    set_by,
                })
                .await;
            }
            Body::OpUser {
                channel,
                target_nickname,
                ..
            } => {
                if target_nickname == self.config.nickname {
                    self.joined.insert(channel.clone(), true);
                }
                self.emit(Event::Opped {
                    channel,
                    nickname: target_nickname,
                })
                .await;
            }
            Body::KickUser {
                channel,
                kicked_by,
                reason,
                ..
            } => {
                self.joined.remove(&channel);
                self.channels.remove_channel(&channel);
                self.emit(Event::Kicked {
                    channel,
                    by: kicked_by,
                    reason,
                })
                .await;
            }
            Body::BanUser {
                channel, banned_by, ..
            } => {
                self.joined.remove(&channel);
                self.channels.remove_channel(&channel);
                self.emit(Event::Kicked {
                    channel,
                    by: banned_by,
                    reason: Some("banned".to_string()),
                })
                .await;
            }
            Body::ImageStart {
                from_id,
                transfer_id,
                total_chunks,
                file_size,
                encrypted_data,
                nonce,
                ..
            } => {
                let metadata = self.inbound.on_start(
                    &mut self.crypto,
                    &from_id,
                    &transfer_id,
                    total_chunks,
                    file_size,
                    &encrypted_data,
                    &nonce,
                )?;
                self.emit(Event::FileOffered {
                    from: self.nickname_of(&from_id),
                    metadata,
                })
                .await;
            }
            Body::ImageChunk {
                from_id,
                transfer_id,
                chunk_number,
                encrypted_data,
                nonce,
                ..
            } => {
                let progress = self.inbound.on_chunk(
                    &mut self.crypto,
                    &from_id,
                    &transfer_id,
                    chunk_number,
                    &encrypted_data,
                    &nonce,
                )?;
                self.emit(Event::FileProgress {
                    from: self.nickname_of(&from_id),
                    progress,
                })
                .await;
            }
            Body::ImageEnd {
                from_id,
                transfer_id,
                ..
            } => {
                let file = self.inbound.on_end(&from_id, &transfer_id)?;
                self.emit(Event::FileReceived {
                    from: self.nickname_of(&from_id),
                    metadata: file.metadata,
                    bytes: file.bytes,
                })
                .await;
            }
            Body::Error {
                code,
                error,
                retry_after,
            } => {
                self.emit(Event::ServerError {
                    code,
                    message: error,
                    retry_after,
                })
                .await;
            }
            other => {
                tracing::debug!(frame = other.type_name(), "Ignoring server frame");
            }
        }
        Ok(())
    }

    /// Send the channel key, peer-encrypted, to a joiner we are responsible
    /// for. Only key-holding operators offer the key; duplicate deliveries
    /// are resolved by first-key-wins on the receiving side.
    async fn offer_channel_key(&mut self, channel: &str, joiner_id: &str) -> Result<()> {
        let is_operator = self.joined.get(channel).copied().unwrap_or(false);
        if !is_operator {
            return Ok(());
        }
        let Some(key_b64) = self.channels.channel_key_b64(channel) else {
            return Ok(());
        };
        let (encrypted_data, nonce) = self.crypto.encrypt(joiner_id, key_b64.as_bytes())?;
        let my_id = self.my_id();
        self.send_frame(Body::KeyExchange {
            from_id: my_id,
            to_id: joiner_id.to_string(),
            public_key: None,
            channel: Some(channel.to_string()),
            encrypted_data: Some(encrypted_data),
            nonce: Some(nonce),
        })
        .await
    }

    /// Kick off a rekey with a peer if the session has aged out.
    async fn maybe_rekey(&mut self, peer_id: &str) -> Result<()> {
        if self.rekey_pending.contains(peer_id) {
            return Ok(());
        }
        if self.crypto.rotation_needed(peer_id)? == Rotation::None {
            return Ok(());
        }
        let new_key = self.crypto.begin_rotation(peer_id)?;
        self.rekey_pending.insert(peer_id.to_string());
        let my_id = self.my_id();
        self.send_frame(Body::RekeyRequest {
            from_id: my_id,
            to_id: peer_id.to_string(),
            new_public_key: new_key,
        })
        .await
    }

    fn resolve_nickname(&self, nickname: &str) -> Option<String> {
        self.by_nick.get(nickname).cloned()
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::PrivateMessage { to_nickname, text } => {
                if let Err(e) = validate::message_text(&text) {
                    self.emit(Event::ServerError {
                        code: "invalid_message".into(),
                        message: e.to_string(),
                        retry_after: None,
                    })
                    .await;
                    return Ok(());
                }
                let Some(peer_id) = self.resolve_nickname(&to_nickname) else {
                    self.emit(Event::ServerError {
                        code: "user_not_found".into(),
                        message: format!("unknown user {to_nickname}"),
                        retry_after: None,
                    })
                    .await;
                    return Ok(());
                };
                let (encrypted_data, nonce) = self.crypto.encrypt(&peer_id, text.as_bytes())?;
                let my_id = self.my_id();
                self.send_frame(Body::PrivateMessage {
                    from_id: my_id,
                    to_id: peer_id.clone(),
                    encrypted_data,
                    nonce,
                })
                .await?;
                self.maybe_rekey(&peer_id).await?;
            }
            Command::ChannelMessage { channel, text } => {
                if let Err(e) = validate::message_text(&text) {
                    self.emit(Event::ServerError {
                        code: "invalid_message".into(),
                        message: e.to_string(),
                        retry_after: None,
                    })
                    .await;
                    return Ok(());
                }
                let (encrypted_data, nonce) =
                    self.channels.encrypt_channel(&channel, text.as_bytes())?;
                let my_id = self.my_id();
                self.send_frame(Body::ChannelMessage {
                    from_id: my_id,
                    to_id: channel,
                    encrypted_data,
                    nonce,
                })
                .await?;
            }
            Command::Join {
                channel,
                password,
                creator_password,
            } => {
                self.send_frame(Body::JoinChannel {
                    channel,
                    password,
                    creator_password,
                })
                .await?;
            }
            Command::Leave { channel } => {
                self.joined.remove(&channel);
                self.channels.remove_channel(&channel);
                self.send_frame(Body::LeaveChannel { channel }).await?;
            }
            Command::SetTopic { channel, topic } => {
                // Free-form input: strip control characters before sending.
                let topic = validate::sanitize(&topic, Some(validate::MAX_TOPIC_CHARS));
                self.send_frame(Body::SetTopic {
                    channel,
                    topic,
                    set_by: None,
                })
                .await?;
            }
            Command::Op {
                channel,
                nickname,
                op_password,
            } => {
                self.send_frame(Body::OpUser {
                    channel,
                    target_nickname: nickname,
                    op_password: Some(op_password),
                    granted_by: None,
                })
                .await?;
            }
            Command::Kick {
                channel,
                nickname,
                reason,
            } => {
                let reason = reason
                    .map(|r| validate::sanitize(&r, Some(validate::MAX_REASON_CHARS)))
                    .filter(|r| !r.is_empty());
                self.send_frame(Body::KickUser {
                    channel,
                    target_nickname: nickname,
                    reason,
                    duration_secs: None,
                    kicked_by: None,
                })
                .await?;
            }
            Command::Ban { channel, nickname } => {
                self.send_frame(Body::BanUser {
                    channel,
                    target_nickname: nickname,
                    duration_secs: None,
                    banned_by: None,
                })
                .await?;
            }
            Command::Unban { channel, nickname } => {
                self.send_frame(Body::UnbanUser {
                    channel,
                    target_nickname: nickname,
                })
                .await?;
            }
            Command::Rekey { nickname } => {
                let Some(peer_id) = self.resolve_nickname(&nickname) else {
                    return Ok(());
                };
                let new_key = self.crypto.begin_rotation(&peer_id)?;
                self.rekey_pending.insert(peer_id.clone());
                let my_id = self.my_id();
                self.send_frame(Body::RekeyRequest {
                    from_id: my_id,
                    to_id: peer_id,
                    new_public_key: new_key,
                })
                .await?;
            }
            Command::SendFile {
                to_nickname,
                filename,
                bytes,
            } => {
                let Some(peer_id) = self.resolve_nickname(&to_nickname) else {
                    self.emit(Event::ServerError {
                        code: "user_not_found".into(),
                        message: format!("unknown user {to_nickname}"),
                        retry_after: None,
                    })
                    .await;
                    return Ok(());
                };
                let out = OutboundTransfer::prepare(&peer_id, &filename, bytes)?;
                let my_id = self.my_id();
                let start = out.start_frame(&mut self.crypto, &my_id)?;
                self.send_frame(start).await?;
                for n in 0..out.total_chunks() {
                    if n > 0 && n % self.config.pace_chunks == 0 {
                        tokio::time::sleep(self.config.pace_window).await;
                    }
                    let chunk = out.chunk_frame(&mut self.crypto, &my_id, n)?;
                    self.send_frame(chunk).await?;
                }
                self.send_frame(out.end_frame(&my_id)).await?;
            }
            Command::Authenticate { username, password } => {
                self.send_frame(Body::AuthRequest { username, password }).await?;
            }
            Command::CreateAccount {
                username,
                password,
                email,
            } => {
                self.send_frame(Body::CreateAccount {
                    username,
                    password,
                    email,
                })
                .await?;
            }
            Command::ChangePassword {
                username,
                old_password,
                new_password,
            } => {
                self.send_frame(Body::ChangePassword {
                    username,
                    old_password,
                    new_password,
                })
                .await?;
            }
            Command::Quit => unreachable!("handled by the run loop"),
        }
        Ok(())
    }
}
