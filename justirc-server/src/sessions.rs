//! In-memory table of connected clients.
//!
//! Primary index by `user_id`, secondary by nickname. Both indices mutate
//! under one lock (the caller's), so nickname uniqueness is atomic with
//! registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use justirc_sdk::proto::UserInfo;

use crate::connection::OutboundQueue;
use crate::error::ServerError;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One connected client.
pub struct SessionEntry {
    pub user_id: String,
    pub nickname: String,
    pub public_key: String,
    pub writer: Arc<OutboundQueue>,
    pub joined_channels: HashSet<String>,
    pub account_name: Option<String>,
    pub connected_since: u64,
    pub last_activity: u64,
}

#[derive(Default)]
pub struct SessionTable {
    by_id: HashMap<String, SessionEntry>,
    by_nick: HashMap<String, String>,
    next_seq: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, allocating its `user_id`. Fails atomically on a
    /// duplicate nickname.
    pub fn register(
        &mut self,
        nickname: &str,
        public_key: &str,
        writer: Arc<OutboundQueue>,
        account_name: Option<String>,
    ) -> Result<String, ServerError> {
        if self.by_nick.contains_key(nickname) {
            return Err(ServerError::NicknameTaken(nickname.to_string()));
        }
        let user_id = format!("user_{}_{}", self.next_seq, nickname);
        self.next_seq += 1;
        let now = unix_now();
        self.by_nick.insert(nickname.to_string(), user_id.clone());
        self.by_id.insert(
            user_id.clone(),
            SessionEntry {
                user_id: user_id.clone(),
                nickname: nickname.to_string(),
                public_key: public_key.to_string(),
                writer,
                joined_channels: HashSet::new(),
                account_name,
                connected_since: now,
                last_activity: now,
            },
        );
        Ok(user_id)
    }

    /// Remove both indices; returns the entry for departure broadcasts.
    pub fn remove(&mut self, user_id: &str) -> Option<SessionEntry> {
        let entry = self.by_id.remove(user_id)?;
        self.by_nick.remove(&entry.nickname);
        Some(entry)
    }

    pub fn get(&self, user_id: &str) -> Option<&SessionEntry> {
        self.by_id.get(user_id)
    }

    pub fn id_by_nick(&self, nickname: &str) -> Option<&str> {
        self.by_nick.get(nickname).map(String::as_str)
    }

    pub fn writer(&self, user_id: &str) -> Option<Arc<OutboundQueue>> {
        self.by_id.get(user_id).map(|e| Arc::clone(&e.writer))
    }

    pub fn touch(&mut self, user_id: &str) {
        if let Some(entry) = self.by_id.get_mut(user_id) {
            entry.last_activity = unix_now();
        }
    }

    pub fn join_channel(&mut self, user_id: &str, channel: &str) {
        if let Some(entry) = self.by_id.get_mut(user_id) {
            entry.joined_channels.insert(channel.to_string());
        }
    }

    pub fn leave_channel(&mut self, user_id: &str, channel: &str) {
        if let Some(entry) = self.by_id.get_mut(user_id) {
            entry.joined_channels.remove(channel);
        }
    }

    pub fn user_count(&self) -> usize {
        self.by_id.len()
    }

    /// Roster snapshot for a `user_list` frame.
    pub fn snapshot(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .by_id
            .values()
            .map(|e| UserInfo {
                user_id: e.user_id.clone(),
                nickname: e.nickname.clone(),
                public_key: e.public_key.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue::new(16))
    }

    #[test]
    fn register_allocates_stable_ids() {
        let mut table = SessionTable::new();
        let alice = table.register("alice", "pkA", queue(), None).unwrap();
        let bob = table.register("bob", "pkB", queue(), None).unwrap();
        assert_eq!(alice, "user_0_alice");
        assert_eq!(bob, "user_1_bob");
        assert_eq!(table.id_by_nick("alice"), Some(alice.as_str()));
        assert_eq!(table.user_count(), 2);
    }

    #[test]
    fn duplicate_nickname_rejected() {
        let mut table = SessionTable::new();
        table.register("alice", "pkA", queue(), None).unwrap();
        assert_eq!(
            table.register("alice", "pkB", queue(), None),
            Err(ServerError::NicknameTaken("alice".into()))
        );
        // Nicknames are case-sensitive: "Alice" is a different handle.
        assert!(table.register("Alice", "pkC", queue(), None).is_ok());
    }

    #[test]
    fn remove_frees_the_nickname() {
        let mut table = SessionTable::new();
        let id = table.register("alice", "pkA", queue(), None).unwrap();
        let entry = table.remove(&id).unwrap();
        assert_eq!(entry.nickname, "alice");
        assert_eq!(table.id_by_nick("alice"), None);
        assert!(table.register("alice", "pkA2", queue(), None).is_ok());
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let mut table = SessionTable::new();
        table.register("bob", "pkB", queue(), None).unwrap();
        table.register("alice", "pkA", queue(), None).unwrap();
        let users = table.snapshot();
        assert_eq!(users.len(), 2);
        assert!(users[0].user_id < users[1].user_id);
    }
}
