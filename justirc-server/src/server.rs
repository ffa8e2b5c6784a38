//! Server state and TCP listener.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use justirc_sdk::proto::{self, Body, Frame};

use crate::auth::AuthStore;
use crate::config::ServerConfig;
use crate::connection;
use crate::ipfilter::IpFilter;
use crate::rate::{ConnectionGate, RateLimiter};
use crate::registry::ChannelRegistry;
use crate::sessions::SessionTable;

/// A queued write of durable state, applied off every lock.
pub struct PersistJob {
    pub path: PathBuf,
    pub contents: String,
}

/// Shared state accessible by all connection handlers.
///
/// Each structure sits behind its own mutex; critical sections cover map
/// lookups and counter updates only, never I/O. Durable-state writes go
/// through `persist_tx` to a single writer task.
pub struct SharedState {
    pub config: ServerConfig,
    pub sessions: Mutex<SessionTable>,
    pub registry: Mutex<ChannelRegistry>,
    pub auth: Mutex<AuthStore>,
    pub rates: Mutex<RateLimiter>,
    pub gate: Mutex<ConnectionGate>,
    pub ipfilter: Mutex<IpFilter>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
}

impl SharedState {
    /// Push one serialized frame to a connected user. Frames to unknown or
    /// departed users are dropped silently (fire-and-forget routing).
    pub fn send_to(&self, user_id: &str, body: Body) {
        let writer = self.sessions.lock().unwrap().writer(user_id);
        if let Some(writer) = writer {
            let mut line = proto::encode(&Frame::new(body));
            line.push('\n');
            writer.push(line);
        }
    }

    /// Broadcast to every member of a channel except `except`.
    pub fn broadcast_channel(&self, channel: &str, except: Option<&str>, body: Body) {
        let members = self.registry.lock().unwrap().members(channel);
        let mut line = proto::encode(&Frame::new(body));
        line.push('\n');
        let sessions = self.sessions.lock().unwrap();
        for member in members {
            if Some(member.as_str()) == except {
                continue;
            }
            if let Some(writer) = sessions.writer(&member) {
                writer.push(line.clone());
            }
        }
    }

    /// Broadcast to every connected user except `except`.
    pub fn broadcast_all(&self, except: Option<&str>, body: Body) {
        let mut line = proto::encode(&Frame::new(body));
        line.push('\n');
        let sessions = self.sessions.lock().unwrap();
        for user_id in sessions.all_ids() {
            if Some(user_id.as_str()) == except {
                continue;
            }
            if let Some(writer) = sessions.writer(&user_id) {
                writer.push(line.clone());
            }
        }
    }

    /// Queue the channel registry for a durable write.
    pub fn persist_registry(&self) {
        let (path, contents) = self.registry.lock().unwrap().snapshot();
        self.queue_persist(path, contents);
    }

    pub fn persist_auth(&self) {
        let (path, contents) = self.auth.lock().unwrap().snapshot();
        self.queue_persist(path, contents);
    }

    fn queue_persist(&self, path: Option<PathBuf>, contents: String) {
        if let Some(path) = path {
            let _ = self.persist_tx.send(PersistJob { path, contents });
        }
    }
}

/// Write-temp-then-rename so a crash mid-write never corrupts the store.
fn write_atomic(path: &PathBuf, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Drain persistence jobs serially, outside all locks.
async fn persistence_writer(mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        if let Err(e) = write_atomic(&job.path, &job.contents) {
            tracing::error!(path = %job.path.display(), "Persistence write failed: {e}");
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Build SharedState, loading persisted data. Spawns the persistence
    /// writer; must run inside a tokio runtime.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        std::fs::create_dir_all(&self.config.data_dir).with_context(|| {
            format!("creating data dir {}", self.config.data_dir.display())
        })?;
        let registry = ChannelRegistry::load(
            &self.config.data_dir.join("channels.json"),
            self.config.max_channels,
        );
        let auth = AuthStore::load(&self.config.data_dir.join("accounts.json"));
        let ipfilter = IpFilter::load(
            &self.config.data_dir.join("ip_rules.json"),
            self.config.enable_ip_whitelist,
        );

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persistence_writer(persist_rx));

        Ok(Arc::new(SharedState {
            sessions: Mutex::new(SessionTable::new()),
            registry: Mutex::new(registry),
            auth: Mutex::new(auth),
            rates: Mutex::new(RateLimiter::new(
                self.config.message_rate,
                self.config.image_chunk_rate,
            )),
            gate: Mutex::new(ConnectionGate::new(
                self.config.connection_rate,
                self.config.ban_threshold,
            )),
            ipfilter: Mutex::new(ipfilter),
            persist_tx,
            config: self.config.clone(),
        }))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr())
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr()))?;
        tracing::info!("Listening on {}", self.config.listen_addr());
        tracing::info!("Routing-only mode: the server cannot decrypt messages");
        let state = self.build_state()?;
        Self::accept_loop(listener, state).await
    }

    /// Start the server and return the bound address + task handle (for
    /// testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        let state = self.build_state()?;
        let handle = tokio::spawn(Self::accept_loop(listener, state));
        Ok((addr, handle))
    }

    async fn accept_loop(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = connection::handle(stream, state).await {
                    tracing::debug!("Connection error: {e}");
                }
            });
        }
    }
}
