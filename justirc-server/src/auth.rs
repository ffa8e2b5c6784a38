//! Account storage and authentication.
//!
//! Passwords are hashed with PBKDF2-HMAC-SHA256 (100 000 iterations,
//! 32-byte random salt) and compared in constant time. Successful logins
//! mint an in-memory session token; tokens die with the process. Five
//! failed attempts within fifteen minutes lock the account for fifteen
//! minutes from the last failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use justirc_sdk::validate;

/// PBKDF2 iteration count for account passwords.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const TOKEN_LEN: usize = 32;
const MAX_FAILED_ATTEMPTS: usize = 5;
const LOCKOUT_WINDOW_SECS: u64 = 15 * 60;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn pbkdf2_hash(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut out)
        .expect("PBKDF2 output length is valid");
    out
}

/// A stored account record. Hash and salt are base64 in the JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    UsernameTaken,
    WeakPassword,
    BadUsername,
    BadEmail,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Token(String),
    InvalidCredentials,
    AccountLocked,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChangeOutcome {
    Changed,
    InvalidCredentials,
    WeakPassword,
}

/// Accounts, live session tokens, and lockout counters.
pub struct AuthStore {
    path: Option<PathBuf>,
    accounts: HashMap<String, Account>,
    /// token -> username. In-memory only; cleared on restart.
    sessions: HashMap<String, String>,
    /// username -> timestamps of recent failed attempts.
    failed: HashMap<String, Vec<u64>>,
}

impl AuthStore {
    /// Load accounts from `path`; a missing file means an empty store.
    pub fn load(path: &Path) -> Self {
        let accounts = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(accounts) => accounts,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Unreadable accounts file: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path: Some(path.to_path_buf()),
            accounts,
            sessions: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            accounts: HashMap::new(),
            sessions: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Serialized store contents for the persistence writer.
    pub fn snapshot(&self) -> (Option<PathBuf>, String) {
        let json = serde_json::to_string_pretty(&self.accounts).unwrap_or_else(|_| "{}".into());
        (self.path.clone(), json)
    }

    pub fn create_account(
        &mut self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> CreateOutcome {
        if validate::nickname(username).is_err() {
            return CreateOutcome::BadUsername;
        }
        if validate::password(password).is_err() {
            return CreateOutcome::WeakPassword;
        }
        if validate::email(email).is_err() {
            return CreateOutcome::BadEmail;
        }
        if self.accounts.contains_key(username) {
            return CreateOutcome::UsernameTaken;
        }
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = pbkdf2_hash(password, &salt, PBKDF2_ITERATIONS);
        self.accounts.insert(
            username.to_string(),
            Account {
                username: username.to_string(),
                password_hash: B64.encode(hash),
                salt: B64.encode(salt),
                iterations: PBKDF2_ITERATIONS,
                email: email.map(str::to_string),
                created_at: unix_now(),
                last_login: None,
            },
        );
        CreateOutcome::Created
    }

    fn verify_password(&self, username: &str, password: &str) -> bool {
        let Some(account) = self.accounts.get(username) else {
            return false;
        };
        let (Ok(stored_hash), Ok(salt)) =
            (B64.decode(&account.password_hash), B64.decode(&account.salt))
        else {
            return false;
        };
        let recomputed = pbkdf2_hash(password, &salt, account.iterations);
        recomputed.as_slice().ct_eq(stored_hash.as_slice()).into()
    }

    fn prune_failures(&mut self, username: &str, now: u64) {
        if let Some(attempts) = self.failed.get_mut(username) {
            attempts.retain(|t| now.saturating_sub(*t) < LOCKOUT_WINDOW_SECS);
            if attempts.is_empty() {
                self.failed.remove(username);
            }
        }
    }

    pub fn is_locked(&mut self, username: &str) -> bool {
        self.prune_failures(username, unix_now());
        self.failed
            .get(username)
            .is_some_and(|a| a.len() >= MAX_FAILED_ATTEMPTS)
    }

    pub fn authenticate(&mut self, username: &str, password: &str) -> AuthOutcome {
        if self.is_locked(username) {
            return AuthOutcome::AccountLocked;
        }
        if !self.verify_password(username, password) {
            self.failed
                .entry(username.to_string())
                .or_default()
                .push(unix_now());
            return AuthOutcome::InvalidCredentials;
        }
        self.failed.remove(username);
        if let Some(account) = self.accounts.get_mut(username) {
            account.last_login = Some(unix_now());
        }
        let mut raw = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);
        self.sessions.insert(token.clone(), username.to_string());
        AuthOutcome::Token(token)
    }

    pub fn verify_session(&self, token: &str) -> Option<&str> {
        self.sessions.get(token).map(String::as_str)
    }

    pub fn logout(&mut self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn change_password(&mut self, username: &str, old: &str, new: &str) -> ChangeOutcome {
        if validate::password(new).is_err() {
            return ChangeOutcome::WeakPassword;
        }
        if !self.verify_password(username, old) {
            return ChangeOutcome::InvalidCredentials;
        }
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = pbkdf2_hash(new, &salt, PBKDF2_ITERATIONS);
        if let Some(account) = self.accounts.get_mut(username) {
            account.password_hash = B64.encode(hash);
            account.salt = B64.encode(salt);
            account.iterations = PBKDF2_ITERATIONS;
        }
        ChangeOutcome::Changed
    }
}
