//! Server configuration.

use clap::Parser;
use std::path::PathBuf;

/// JustIRC routing server. The server never decrypts, logs, or persists
/// message bodies; it reads envelopes and routes frames.
#[derive(Debug, Clone, Parser)]
#[command(name = "justirc-server", version)]
pub struct ServerConfig {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind.
    #[arg(long, default_value_t = 6667)]
    pub port: u16,

    /// Server name shown to clients.
    #[arg(long, default_value = "JustIRC Server")]
    pub server_name: String,

    /// Short description sent in the registration welcome.
    #[arg(long, default_value = "Welcome to JustIRC!")]
    pub description: String,

    /// Directory for persistent state (channels, accounts, IP rules).
    #[arg(long, default_value = "./server_data")]
    pub data_dir: PathBuf,

    /// Hard cap on the number of persistent channels.
    #[arg(long, default_value_t = 500)]
    pub max_channels: usize,

    /// Hard cap on concurrently connected users.
    #[arg(long, default_value_t = 1000)]
    pub max_users: usize,

    /// Enable the accounts subsystem (create_account / auth_request).
    #[arg(long)]
    pub enable_authentication: bool,

    /// Reject registration without a valid session token.
    /// Implies --enable-authentication.
    #[arg(long)]
    pub require_authentication: bool,

    /// Switch the IP filter from blacklist to whitelist mode.
    #[arg(long)]
    pub enable_ip_whitelist: bool,

    /// Idle seconds before a connection is closed.
    #[arg(long, default_value_t = 300)]
    pub connection_timeout: u64,

    /// Per-read timeout in seconds.
    #[arg(long, default_value_t = 60)]
    pub read_timeout: u64,

    /// Maximum frame size in bytes.
    #[arg(long, default_value_t = 65536)]
    pub max_message_size: usize,

    /// Messages allowed per client per 10-second window.
    #[arg(long, default_value_t = 30)]
    pub message_rate: u32,

    /// Image chunks allowed per client per 10-second window.
    #[arg(long, default_value_t = 100)]
    pub image_chunk_rate: u32,

    /// Connections allowed per source IP per minute.
    #[arg(long, default_value_t = 5)]
    pub connection_rate: u32,

    /// Rate-limit violations before a source IP is temp-banned.
    #[arg(long, default_value_t = 10)]
    pub ban_threshold: u32,

    /// Seconds a session key may live before clients should rekey.
    /// Advisory: rotation runs on clients; the server only routes.
    #[arg(long, default_value_t = 3600)]
    pub key_rotation_interval_seconds: u64,

    /// Messages a session key may encrypt before clients should rekey.
    #[arg(long, default_value_t = 10000)]
    pub max_messages_per_key: u64,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_enabled(&self) -> bool {
        self.enable_authentication || self.require_authentication
    }

    /// Defaults with an ephemeral bind port, for tests.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            server_name: "test".into(),
            description: "test server".into(),
            data_dir,
            max_channels: 500,
            max_users: 1000,
            enable_authentication: false,
            require_authentication: false,
            enable_ip_whitelist: false,
            connection_timeout: 300,
            read_timeout: 60,
            max_message_size: justirc_sdk::proto::MAX_FRAME_BYTES,
            message_rate: 30,
            image_chunk_rate: 100,
            // Tests open many sockets from one address.
            connection_rate: 10_000,
            ban_threshold: 10,
            key_rotation_interval_seconds: 3600,
            max_messages_per_key: 10_000,
        }
    }
}
