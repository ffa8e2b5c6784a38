//! Pre-registration dispatch: authentication, account management, register.

use std::sync::Arc;

use justirc_sdk::proto::Body;
use justirc_sdk::validate;

use super::{encode_line, Connection, Flow, OutboundQueue};
use crate::auth::{AuthOutcome, ChangeOutcome, CreateOutcome};
use crate::error::ServerError;
use crate::server::SharedState;

/// Frames accepted before `register` completes.
pub(super) fn dispatch_preregistration(
    conn: &mut Connection,
    body: Body,
    state: &Arc<SharedState>,
    queue: &Arc<OutboundQueue>,
) -> Flow {
    match body {
        Body::AuthRequest { username, password } => {
            handle_auth_request(conn, &username, &password, state, queue)
        }
        Body::CreateAccount {
            username,
            password,
            email,
        } => handle_create_account(conn, &username, &password, email.as_deref(), state, queue),
        Body::ChangePassword {
            username,
            old_password,
            new_password,
        } => handle_change_password(conn, &username, &old_password, &new_password, state, queue),
        Body::Register {
            nickname,
            public_key,
            session_token,
        } => handle_register(conn, &nickname, &public_key, session_token.as_deref(), state, queue),
        Body::Disconnect => Flow::Close,
        other => {
            tracing::debug!(conn = %conn.id, frame = other.type_name(), "Frame before registration");
            let error = if conn.awaiting_auth {
                ServerError::AuthRequired
            } else {
                ServerError::NotAuthorized
            };
            queue.push(encode_line(error.to_frame()));
            Flow::Continue
        }
    }
}

fn handle_auth_request(
    conn: &mut Connection,
    username: &str,
    password: &str,
    state: &Arc<SharedState>,
    queue: &Arc<OutboundQueue>,
) -> Flow {
    if !state.config.auth_enabled() {
        queue.push(encode_line(ServerError::NotAuthorized.to_frame()));
        return Flow::Continue;
    }
    let outcome = state.auth.lock().unwrap().authenticate(username, password);
    match outcome {
        AuthOutcome::Token(session_token) => {
            tracing::info!(conn = %conn.id, %username, "Authenticated");
            conn.awaiting_auth = false;
            conn.account = Some(username.to_string());
            state.persist_auth();
            queue.push(encode_line(Body::AuthResponse {
                success: true,
                session_token: Some(session_token),
                message: None,
            }));
        }
        AuthOutcome::InvalidCredentials => {
            tracing::info!(conn = %conn.id, %username, "Authentication failed");
            queue.push(encode_line(ServerError::InvalidCredentials.to_frame()));
        }
        AuthOutcome::AccountLocked => {
            tracing::warn!(conn = %conn.id, %username, "Locked account");
            queue.push(encode_line(ServerError::AccountLocked.to_frame()));
        }
    }
    Flow::Continue
}

fn handle_create_account(
    conn: &mut Connection,
    username: &str,
    password: &str,
    email: Option<&str>,
    state: &Arc<SharedState>,
    queue: &Arc<OutboundQueue>,
) -> Flow {
    if !state.config.auth_enabled() {
        queue.push(encode_line(ServerError::NotAuthorized.to_frame()));
        return Flow::Continue;
    }
    let outcome = state
        .auth
        .lock()
        .unwrap()
        .create_account(username, password, email);
    let (success, message) = match outcome {
        CreateOutcome::Created => {
            tracing::info!(conn = %conn.id, %username, "Account created");
            state.persist_auth();
            (true, format!("account {username} created"))
        }
        CreateOutcome::UsernameTaken => (false, format!("username {username} is taken")),
        CreateOutcome::WeakPassword => (
            false,
            "password must be 8-256 printable characters".to_string(),
        ),
        CreateOutcome::BadUsername => (
            false,
            "username must be 3-20 characters of letters, numbers, _ and -".to_string(),
        ),
        CreateOutcome::BadEmail => (false, "invalid email address".to_string()),
    };
    queue.push(encode_line(Body::Ack {
        success,
        message: Some(message),
        user_id: None,
        channel: None,
        members: None,
        is_operator: None,
        topic: None,
    }));
    Flow::Continue
}

pub(super) fn handle_change_password(
    conn: &Connection,
    username: &str,
    old_password: &str,
    new_password: &str,
    state: &Arc<SharedState>,
    queue: &Arc<OutboundQueue>,
) -> Flow {
    if !state.config.auth_enabled() {
        queue.push(encode_line(ServerError::NotAuthorized.to_frame()));
        return Flow::Continue;
    }
    let outcome = state
        .auth
        .lock()
        .unwrap()
        .change_password(username, old_password, new_password);
    let (success, message) = match outcome {
        ChangeOutcome::Changed => {
            tracing::info!(conn = %conn.id, %username, "Password changed");
            state.persist_auth();
            (true, "password changed".to_string())
        }
        ChangeOutcome::InvalidCredentials => (false, "invalid username or password".to_string()),
        ChangeOutcome::WeakPassword => (
            false,
            "password must be 8-256 printable characters".to_string(),
        ),
    };
    queue.push(encode_line(Body::Ack {
        success,
        message: Some(message),
        user_id: None,
        channel: None,
        members: None,
        is_operator: None,
        topic: None,
    }));
    Flow::Continue
}

fn handle_register(
    conn: &mut Connection,
    nickname: &str,
    public_key: &str,
    session_token: Option<&str>,
    state: &Arc<SharedState>,
    queue: &Arc<OutboundQueue>,
) -> Flow {
    // Mandatory authentication: the token must resolve to an account.
    if state.config.require_authentication {
        let account = session_token.and_then(|token| {
            state
                .auth
                .lock()
                .unwrap()
                .verify_session(token)
                .map(str::to_string)
        });
        match account {
            Some(account) => {
                conn.awaiting_auth = false;
                conn.account = Some(account);
            }
            None => {
                queue.push(encode_line(ServerError::AuthRequired.to_frame()));
                return Flow::Continue;
            }
        }
    }

    if let Err(reason) = validate::nickname(nickname) {
        queue.push(encode_line(
            ServerError::NicknameInvalid(reason.to_string()).to_frame(),
        ));
        return Flow::Continue;
    }

    let registered = {
        let mut sessions = state.sessions.lock().unwrap();
        if sessions.user_count() >= state.config.max_users {
            Err(ServerError::UserLimitReached)
        } else {
            sessions.register(nickname, public_key, Arc::clone(queue), conn.account.clone())
        }
    };
    let user_id = match registered {
        Ok(user_id) => user_id,
        Err(e) => {
            queue.push(encode_line(e.to_frame()));
            return Flow::Continue;
        }
    };

    conn.user_id = Some(user_id.clone());
    conn.nickname = Some(nickname.to_string());
    tracing::info!(conn = %conn.id, %nickname, %user_id, "Registered");

    queue.push(encode_line(Body::Ack {
        success: true,
        message: Some(format!(
            "Welcome to {}, {nickname}! {}",
            state.config.server_name, state.config.description
        )),
        user_id: Some(user_id.clone()),
        channel: None,
        members: None,
        is_operator: None,
        topic: None,
    }));

    // Roster snapshot to the new client (including itself), then announce
    // the arrival to everyone else with only nickname and public key.
    let users = state.sessions.lock().unwrap().snapshot();
    queue.push(encode_line(Body::UserList { users }));
    state.broadcast_all(
        Some(&user_id),
        Body::UserJoined {
            user_id: user_id.clone(),
            nickname: nickname.to_string(),
            public_key: public_key.to_string(),
            channel: None,
        },
    );
    Flow::Continue
}
