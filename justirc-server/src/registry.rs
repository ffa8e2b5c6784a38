//! Channel registry: metadata, membership, operator authority, persistence.
//!
//! Channels are persistent: passwords, topics, bans, and stored operator
//! passwords survive the channel emptying out and server restarts.
//! Presence (`members`/`operators`) is ephemeral and resets on load.
//! Channel passwords are shared secrets, so they get salted SHA-256 rather
//! than the PBKDF2 reserved for account credentials.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use justirc_sdk::validate;

use crate::error::ServerError;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Salted SHA-256 digest of a shared channel secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaltedHash {
    salt: String,
    hash: String,
}

impl SaltedHash {
    pub fn new(password: &str) -> Self {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let hash = Self::digest(&salt, password);
        Self {
            salt: B64.encode(salt),
            hash: B64.encode(hash),
        }
    }

    fn digest(salt: &[u8], password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }

    pub fn verify(&self, password: &str) -> bool {
        let (Ok(salt), Ok(stored)) = (B64.decode(&self.salt), B64.decode(&self.hash)) else {
            return false;
        };
        let recomputed = Self::digest(&salt, password);
        recomputed.as_slice().ct_eq(stored.as_slice()).into()
    }
}

/// One channel's state. Serialized fields persist; presence does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_password: Option<SaltedHash>,
    pub creator_password: SaltedHash,
    /// nickname -> stored operator password, surviving disconnects so an
    /// operator can reclaim status on rejoin.
    #[serde(default)]
    pub operator_passwords: HashMap<String, SaltedHash>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub modes: HashSet<String>,
    /// nickname -> optional expiry (unix seconds; `None` is permanent).
    #[serde(default)]
    pub banned: HashMap<String, Option<u64>>,
    /// nickname -> rejoin blocked until (unix seconds).
    #[serde(default)]
    pub kicked_until: HashMap<String, u64>,

    #[serde(skip)]
    pub members: HashSet<String>,
    #[serde(skip)]
    pub operators: HashSet<String>,
}

impl ChannelRecord {
    fn purge_expired(&mut self) {
        let now = unix_now();
        self.banned
            .retain(|_, expiry| expiry.map_or(true, |exp| exp > now));
        self.kicked_until.retain(|_, until| *until > now);
    }
}

/// Result of a successful `create_or_join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub created: bool,
    pub is_operator: bool,
    pub topic: String,
}

/// Channel listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub users: usize,
    pub protected: bool,
    pub topic: String,
}

pub struct ChannelRegistry {
    path: Option<PathBuf>,
    channels: HashMap<String, ChannelRecord>,
    max_channels: usize,
}

impl ChannelRegistry {
    /// Load persisted channels; a missing file means an empty registry.
    pub fn load(path: &Path, max_channels: usize) -> Self {
        let channels: HashMap<String, ChannelRecord> = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(channels) => channels,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Unreadable channel store: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        tracing::info!(count = channels.len(), "Loaded persistent channels");
        Self {
            path: Some(path.to_path_buf()),
            channels,
            max_channels,
        }
    }

    pub fn in_memory(max_channels: usize) -> Self {
        Self {
            path: None,
            channels: HashMap::new(),
            max_channels,
        }
    }

    /// Serialized registry contents for the persistence writer.
    pub fn snapshot(&self) -> (Option<PathBuf>, String) {
        let json = serde_json::to_string_pretty(&self.channels).unwrap_or_else(|_| "{}".into());
        (self.path.clone(), json)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Join a channel, creating it if absent. Mutates persisted state when a
    /// channel is created; callers must persist afterwards in that case.
    pub fn create_or_join(
        &mut self,
        user_id: &str,
        nickname: &str,
        channel: &str,
        join_password: Option<&str>,
        creator_password: Option<&str>,
    ) -> Result<JoinOutcome, ServerError> {
        if validate::channel_name(channel).is_err() {
            return Err(ServerError::ChannelNotFound(channel.to_string()));
        }

        if let Some(record) = self.channels.get_mut(channel) {
            record.purge_expired();
            if record.banned.contains_key(nickname) {
                return Err(ServerError::BannedFromChannel(channel.to_string()));
            }
            if record.kicked_until.contains_key(nickname) {
                return Err(ServerError::BannedFromChannel(channel.to_string()));
            }

            // Operator reclaim: a matching creator password, or a stored
            // operator password for this nickname.
            let mut promoted = false;
            if let Some(creator_password) = creator_password {
                if record.creator_password.verify(creator_password) {
                    promoted = true;
                } else if record
                    .operator_passwords
                    .get(nickname)
                    .is_some_and(|h| h.verify(creator_password))
                {
                    promoted = true;
                } else {
                    return Err(ServerError::WrongCreatorPassword);
                }
            }

            // A password supplied for a password-less channel is ignored.
            if let Some(expected) = &record.join_password {
                let supplied = join_password.unwrap_or("");
                if !expected.verify(supplied) {
                    return Err(ServerError::WrongChannelPassword);
                }
            }

            record.members.insert(user_id.to_string());
            if promoted {
                record.operators.insert(user_id.to_string());
            }
            return Ok(JoinOutcome {
                created: false,
                is_operator: record.operators.contains(user_id),
                topic: record.topic.clone(),
            });
        }

        // New channel: creating requires a creator password so operator
        // status can be reclaimed later.
        if self.channels.len() >= self.max_channels {
            return Err(ServerError::ChannelLimitReached);
        }
        let Some(creator_password) = creator_password else {
            return Err(ServerError::WrongCreatorPassword);
        };
        if validate::creator_password(creator_password).is_err() {
            return Err(ServerError::WrongCreatorPassword);
        }
        let mut record = ChannelRecord {
            name: channel.to_string(),
            created_at: unix_now(),
            join_password: join_password.map(SaltedHash::new),
            creator_password: SaltedHash::new(creator_password),
            operator_passwords: HashMap::new(),
            topic: String::new(),
            modes: HashSet::new(),
            banned: HashMap::new(),
            kicked_until: HashMap::new(),
            members: HashSet::new(),
            operators: HashSet::new(),
        };
        record.members.insert(user_id.to_string());
        record.operators.insert(user_id.to_string());
        self.channels.insert(channel.to_string(), record);
        Ok(JoinOutcome {
            created: true,
            is_operator: true,
            topic: String::new(),
        })
    }

    pub fn leave(&mut self, user_id: &str, channel: &str) -> Result<(), ServerError> {
        let record = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| ServerError::ChannelNotFound(channel.to_string()))?;
        if !record.members.remove(user_id) {
            return Err(ServerError::NotInChannel(channel.to_string()));
        }
        record.operators.remove(user_id);
        Ok(())
    }

    fn operator_checked(
        &mut self,
        user_id: &str,
        channel: &str,
    ) -> Result<&mut ChannelRecord, ServerError> {
        let record = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| ServerError::ChannelNotFound(channel.to_string()))?;
        if !record.members.contains(user_id) {
            return Err(ServerError::NotInChannel(channel.to_string()));
        }
        if !record.operators.contains(user_id) {
            return Err(ServerError::NotOperator(channel.to_string()));
        }
        Ok(record)
    }

    /// Operators only; persisted.
    pub fn set_topic(
        &mut self,
        user_id: &str,
        channel: &str,
        topic: &str,
    ) -> Result<(), ServerError> {
        if validate::topic(topic).is_err() {
            return Err(ServerError::NotAuthorized);
        }
        let record = self.operator_checked(user_id, channel)?;
        record.topic = topic.to_string();
        Ok(())
    }

    /// Store an operator password for `target_nickname` and promote them if
    /// they are currently a member. Persisted.
    pub fn op_user(
        &mut self,
        requester_id: &str,
        channel: &str,
        target_nickname: &str,
        target_user_id: Option<&str>,
        op_password: &str,
    ) -> Result<bool, ServerError> {
        if validate::creator_password(op_password).is_err() {
            return Err(ServerError::NotAuthorized);
        }
        let record = self.operator_checked(requester_id, channel)?;
        record
            .operator_passwords
            .insert(target_nickname.to_string(), SaltedHash::new(op_password));
        let promoted = match target_user_id {
            Some(id) if record.members.contains(id) => {
                record.operators.insert(id.to_string());
                true
            }
            _ => false,
        };
        Ok(promoted)
    }

    /// Remove the target from the channel; with `duration_secs` the nickname
    /// cannot rejoin until the timeout passes (persisted).
    pub fn kick(
        &mut self,
        operator_id: &str,
        channel: &str,
        target_nickname: &str,
        target_user_id: &str,
        duration_secs: Option<u64>,
    ) -> Result<(), ServerError> {
        if operator_id == target_user_id {
            return Err(ServerError::NotAuthorized);
        }
        let record = self.operator_checked(operator_id, channel)?;
        if !record.members.remove(target_user_id) {
            return Err(ServerError::UserNotFound(target_nickname.to_string()));
        }
        record.operators.remove(target_user_id);
        if let Some(duration) = duration_secs {
            record
                .kicked_until
                .insert(target_nickname.to_string(), unix_now() + duration);
        }
        Ok(())
    }

    /// Ban a nickname (optionally expiring) and drop them from the channel
    /// if present. Persisted.
    pub fn ban(
        &mut self,
        operator_id: &str,
        channel: &str,
        target_nickname: &str,
        target_user_id: Option<&str>,
        duration_secs: Option<u64>,
    ) -> Result<(), ServerError> {
        let record = self.operator_checked(operator_id, channel)?;
        let expires_at = duration_secs.map(|d| unix_now() + d);
        record.banned.insert(target_nickname.to_string(), expires_at);
        if let Some(id) = target_user_id {
            record.members.remove(id);
            record.operators.remove(id);
        }
        Ok(())
    }

    /// Persisted.
    pub fn unban(
        &mut self,
        operator_id: &str,
        channel: &str,
        target_nickname: &str,
    ) -> Result<bool, ServerError> {
        let record = self.operator_checked(operator_id, channel)?;
        Ok(record.banned.remove(target_nickname).is_some())
    }

    /// Drop a user from every channel. Stored operator passwords survive so
    /// status can be reclaimed on rejoin. Returns the channels left.
    pub fn remove_user_everywhere(&mut self, user_id: &str) -> Vec<String> {
        let mut left = Vec::new();
        for (name, record) in self.channels.iter_mut() {
            if record.members.remove(user_id) {
                record.operators.remove(user_id);
                left.push(name.clone());
            }
        }
        left
    }

    pub fn is_member(&self, user_id: &str, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|r| r.members.contains(user_id))
    }

    pub fn is_operator(&self, user_id: &str, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|r| r.operators.contains(user_id))
    }

    pub fn members(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn operators(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|r| r.operators.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic(&self, channel: &str) -> Option<String> {
        self.channels.get(channel).map(|r| r.topic.clone())
    }

    pub fn list(&self) -> Vec<ChannelSummary> {
        let mut summaries: Vec<ChannelSummary> = self
            .channels
            .values()
            .map(|r| ChannelSummary {
                name: r.name.clone(),
                users: r.members.len(),
                protected: r.join_password.is_some(),
                topic: r.topic.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}
