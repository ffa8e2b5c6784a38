#![allow(dead_code)] // not every test binary uses every helper
//! Shared helpers: an in-process server and a raw frame-level test client.
//!
//! Tests drive the real TCP surface with `justirc-sdk` doing the client-side
//! cryptography, so every assertion covers the actual wire behavior.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use justirc_sdk::crypto::CryptoCore;
use justirc_sdk::proto::{self, Body, Frame, MemberInfo};
use justirc_server::config::ServerConfig;
use justirc_server::server::Server;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn start_server(data_dir: &Path) -> SocketAddr {
    start_server_with(ServerConfig::for_tests(data_dir.to_path_buf())).await
}

pub async fn start_server_with(config: ServerConfig) -> SocketAddr {
    let (addr, _handle) = Server::new(config).start().await.expect("server start");
    addr
}

pub struct TestClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub crypto: CryptoCore,
    pub user_id: String,
    pub nickname: String,
}

impl TestClient {
    /// Open a raw connection without registering.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            crypto: CryptoCore::generate(),
            user_id: String::new(),
            nickname: String::new(),
        }
    }

    /// Connect and complete registration; panics on any rejection.
    pub async fn register(addr: SocketAddr, nickname: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.nickname = nickname.to_string();
        let public_key = client.crypto.public_key_b64();
        client
            .send(Body::Register {
                nickname: nickname.to_string(),
                public_key,
                session_token: None,
            })
            .await;
        let ack = client
            .recv_until("registration ack", |b| {
                matches!(b, Body::Ack { user_id: Some(_), .. })
            })
            .await;
        let Body::Ack {
            user_id: Some(user_id),
            ..
        } = ack
        else {
            unreachable!()
        };
        client.user_id = user_id;
        client
    }

    pub async fn send(&mut self, body: Body) {
        let mut line = proto::encode(&Frame::new(body));
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("send");
        self.writer.flush().await.expect("flush");
    }

    /// Send raw bytes, bypassing the codec (protocol-violation tests).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("send raw");
        self.writer.flush().await.expect("flush");
    }

    /// Next frame, or panic after the timeout.
    pub async fn recv(&mut self) -> Body {
        let mut line = String::new();
        let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("recv timed out")
            .expect("recv");
        assert!(n > 0, "connection closed while a frame was expected");
        proto::decode(line.trim()).expect("server sent an undecodable frame").body
    }

    /// Skip frames until `pred` matches (bounded, to fail fast on a wedge).
    pub async fn recv_until<F>(&mut self, what: &str, pred: F) -> Body
    where
        F: Fn(&Body) -> bool,
    {
        for _ in 0..64 {
            let body = self.recv().await;
            if pred(&body) {
                return body;
            }
        }
        panic!("never received {what}");
    }

    /// Expect an `error` frame with the given code.
    pub async fn expect_error(&mut self, expected_code: &str) {
        let body = self
            .recv_until(&format!("error {expected_code}"), |b| {
                matches!(b, Body::Error { .. })
            })
            .await;
        let Body::Error { code, .. } = body else {
            unreachable!()
        };
        assert_eq!(code, expected_code);
    }

    /// True once the server closes the connection.
    pub async fn closed(&mut self) -> bool {
        loop {
            let mut line = String::new();
            let Ok(read) =
                tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line)).await
            else {
                return false;
            };
            match read {
                Ok(0) | Err(_) => return true,
                Ok(_) => continue, // drain whatever was still queued
            }
        }
    }

    /// Orderly disconnect: the server finishes cleanup (session removal,
    /// channel departure broadcasts) before it closes the socket, so waiting
    /// for EOF here prevents races with a follow-up reconnect.
    pub async fn disconnect(mut self) {
        self.send(Body::Disconnect).await;
        assert!(self.closed().await, "server did not close after disconnect");
    }

    /// Join a channel and return `(is_operator, members, topic)` from the ack.
    pub async fn join(
        &mut self,
        channel: &str,
        password: Option<&str>,
        creator_password: Option<&str>,
    ) -> (bool, Vec<MemberInfo>, Option<String>) {
        self.send(Body::JoinChannel {
            channel: channel.to_string(),
            password: password.map(str::to_string),
            creator_password: creator_password.map(str::to_string),
        })
        .await;
        let ack = self
            .recv_until("join ack", |b| {
                matches!(b, Body::Ack { channel: Some(_), .. } | Body::Error { .. })
            })
            .await;
        match ack {
            Body::Ack {
                members,
                is_operator,
                topic,
                ..
            } => (
                is_operator.unwrap_or(false),
                members.unwrap_or_default(),
                topic,
            ),
            Body::Error { code, error, .. } => panic!("join failed: {code}: {error}"),
            _ => unreachable!(),
        }
    }
}
