//! Channel operations: join, leave, topic, op, kick, ban, unban.

use std::sync::Arc;

use justirc_sdk::proto::{Body, MemberInfo};
use justirc_sdk::validate;

use super::{send_error, Connection, Flow};
use crate::error::ServerError;
use crate::server::SharedState;

fn self_id(conn: &Connection) -> &str {
    conn.user_id.as_deref().expect("active connection has a user_id")
}

fn self_nick(conn: &Connection) -> &str {
    conn.nickname.as_deref().expect("active connection has a nickname")
}

fn plain_ack(message: String) -> Body {
    Body::Ack {
        success: true,
        message: Some(message),
        user_id: None,
        channel: None,
        members: None,
        is_operator: None,
        topic: None,
    }
}

pub(super) fn handle_join(
    conn: &Connection,
    channel: &str,
    password: Option<String>,
    creator_password: Option<String>,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    let nickname = self_nick(conn);

    let outcome = state.registry.lock().unwrap().create_or_join(
        user_id,
        nickname,
        channel,
        password.as_deref(),
        creator_password.as_deref(),
    );
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            send_error(conn, state, e);
            return Flow::Continue;
        }
    };
    state.sessions.lock().unwrap().join_channel(user_id, channel);
    if outcome.created {
        state.persist_registry();
        tracing::info!(%channel, %nickname, "Channel created");
    } else {
        tracing::info!(%channel, %nickname, operator = outcome.is_operator, "Joined channel");
    }

    // Member roster with operator flags for the join ack.
    let (member_ids, operator_ids) = {
        let registry = state.registry.lock().unwrap();
        (registry.members(channel), registry.operators(channel))
    };
    let members: Vec<MemberInfo> = {
        let sessions = state.sessions.lock().unwrap();
        let mut members: Vec<MemberInfo> = member_ids
            .iter()
            .filter_map(|id| {
                sessions.get(id).map(|entry| MemberInfo {
                    user_id: entry.user_id.clone(),
                    nickname: entry.nickname.clone(),
                    public_key: entry.public_key.clone(),
                    is_operator: operator_ids.contains(id),
                })
            })
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    };
    let public_key = members
        .iter()
        .find(|m| m.user_id == user_id)
        .map(|m| m.public_key.clone())
        .unwrap_or_default();

    state.send_to(
        user_id,
        Body::Ack {
            success: true,
            message: None,
            user_id: None,
            channel: Some(channel.to_string()),
            members: Some(members),
            is_operator: Some(outcome.is_operator),
            topic: match outcome.topic.is_empty() {
                true => None,
                false => Some(outcome.topic.clone()),
            },
        },
    );

    state.broadcast_channel(
        channel,
        Some(user_id),
        Body::UserJoined {
            user_id: user_id.to_string(),
            nickname: nickname.to_string(),
            public_key,
            channel: Some(channel.to_string()),
        },
    );
    Flow::Continue
}

pub(super) fn handle_leave(conn: &Connection, channel: &str, state: &Arc<SharedState>) -> Flow {
    let user_id = self_id(conn);
    let left = state.registry.lock().unwrap().leave(user_id, channel);
    if let Err(e) = left {
        send_error(conn, state, e);
        return Flow::Continue;
    }
    state.sessions.lock().unwrap().leave_channel(user_id, channel);
    state.send_to(user_id, plain_ack(format!("left {channel}")));
    state.broadcast_channel(
        channel,
        Some(user_id),
        Body::UserLeft {
            user_id: user_id.to_string(),
            nickname: self_nick(conn).to_string(),
            channel: Some(channel.to_string()),
        },
    );
    Flow::Continue
}

pub(super) fn handle_topic(
    conn: &Connection,
    channel: &str,
    topic: &str,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    let set = state.registry.lock().unwrap().set_topic(user_id, channel, topic);
    if let Err(e) = set {
        send_error(conn, state, e);
        return Flow::Continue;
    }
    state.persist_registry();
    state.send_to(user_id, plain_ack(format!("topic set for {channel}")));
    state.broadcast_channel(
        channel,
        Some(user_id),
        Body::SetTopic {
            channel: channel.to_string(),
            topic: topic.to_string(),
            set_by: Some(self_nick(conn).to_string()),
        },
    );
    Flow::Continue
}

pub(super) fn handle_op(
    conn: &Connection,
    channel: &str,
    target_nickname: &str,
    op_password: Option<String>,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    let Some(op_password) = op_password else {
        send_error(conn, state, ServerError::NotAuthorized);
        return Flow::Continue;
    };
    let target_user_id = state
        .sessions
        .lock()
        .unwrap()
        .id_by_nick(target_nickname)
        .map(str::to_string);

    let promoted = state.registry.lock().unwrap().op_user(
        user_id,
        channel,
        target_nickname,
        target_user_id.as_deref(),
        &op_password,
    );
    match promoted {
        Ok(_) => {}
        Err(e) => {
            send_error(conn, state, e);
            return Flow::Continue;
        }
    }
    state.persist_registry();
    tracing::info!(%channel, target = %target_nickname, by = %self_nick(conn), "Operator granted");

    state.send_to(
        user_id,
        plain_ack(format!("{target_nickname} is now an operator in {channel}")),
    );
    // The whole channel (target included) learns about the promotion.
    state.broadcast_channel(
        channel,
        Some(user_id),
        Body::OpUser {
            channel: channel.to_string(),
            target_nickname: target_nickname.to_string(),
            op_password: None,
            granted_by: Some(self_nick(conn).to_string()),
        },
    );
    Flow::Continue
}

pub(super) fn handle_kick(
    conn: &Connection,
    channel: &str,
    target_nickname: &str,
    reason: Option<String>,
    duration_secs: Option<u64>,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    if reason
        .as_deref()
        .is_some_and(|r| validate::reason(r).is_err())
    {
        send_error(conn, state, ServerError::NotAuthorized);
        return Flow::Continue;
    }
    let target_user_id = state
        .sessions
        .lock()
        .unwrap()
        .id_by_nick(target_nickname)
        .map(str::to_string);
    let Some(target_user_id) = target_user_id else {
        send_error(conn, state, ServerError::UserNotFound(target_nickname.to_string()));
        return Flow::Continue;
    };

    let kicked = state.registry.lock().unwrap().kick(
        user_id,
        channel,
        target_nickname,
        &target_user_id,
        duration_secs,
    );
    if let Err(e) = kicked {
        send_error(conn, state, e);
        return Flow::Continue;
    }
    state
        .sessions
        .lock()
        .unwrap()
        .leave_channel(&target_user_id, channel);
    if duration_secs.is_some() {
        state.persist_registry();
    }
    tracing::info!(%channel, target = %target_nickname, by = %self_nick(conn), "Kicked");

    state.send_to(
        &target_user_id,
        Body::KickUser {
            channel: channel.to_string(),
            target_nickname: target_nickname.to_string(),
            reason: reason.clone(),
            duration_secs,
            kicked_by: Some(self_nick(conn).to_string()),
        },
    );
    state.broadcast_channel(
        channel,
        Some(user_id),
        Body::UserLeft {
            user_id: target_user_id.clone(),
            nickname: target_nickname.to_string(),
            channel: Some(channel.to_string()),
        },
    );
    state.send_to(
        user_id,
        plain_ack(format!("{target_nickname} was kicked from {channel}")),
    );
    Flow::Continue
}

pub(super) fn handle_ban(
    conn: &Connection,
    channel: &str,
    target_nickname: &str,
    duration_secs: Option<u64>,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    let target_user_id = state
        .sessions
        .lock()
        .unwrap()
        .id_by_nick(target_nickname)
        .map(str::to_string);
    let was_member = target_user_id
        .as_deref()
        .is_some_and(|id| state.registry.lock().unwrap().is_member(id, channel));

    let banned = state.registry.lock().unwrap().ban(
        user_id,
        channel,
        target_nickname,
        target_user_id.as_deref(),
        duration_secs,
    );
    if let Err(e) = banned {
        send_error(conn, state, e);
        return Flow::Continue;
    }
    state.persist_registry();
    tracing::info!(%channel, target = %target_nickname, by = %self_nick(conn), "Banned");

    if let (Some(target_user_id), true) = (target_user_id.as_deref(), was_member) {
        state
            .sessions
            .lock()
            .unwrap()
            .leave_channel(target_user_id, channel);
        state.send_to(
            target_user_id,
            Body::BanUser {
                channel: channel.to_string(),
                target_nickname: target_nickname.to_string(),
                duration_secs,
                banned_by: Some(self_nick(conn).to_string()),
            },
        );
        state.broadcast_channel(
            channel,
            Some(user_id),
            Body::UserLeft {
                user_id: target_user_id.to_string(),
                nickname: target_nickname.to_string(),
                channel: Some(channel.to_string()),
            },
        );
    }
    state.send_to(
        user_id,
        plain_ack(format!("{target_nickname} is banned from {channel}")),
    );
    Flow::Continue
}

pub(super) fn handle_unban(
    conn: &Connection,
    channel: &str,
    target_nickname: &str,
    state: &Arc<SharedState>,
) -> Flow {
    let user_id = self_id(conn);
    let removed = state
        .registry
        .lock()
        .unwrap()
        .unban(user_id, channel, target_nickname);
    match removed {
        Ok(true) => {
            state.persist_registry();
            state.send_to(
                user_id,
                plain_ack(format!("{target_nickname} is no longer banned from {channel}")),
            );
        }
        Ok(false) => {
            state.send_to(
                user_id,
                plain_ack(format!("{target_nickname} was not banned from {channel}")),
            );
        }
        Err(e) => send_error(conn, state, e),
    }
    Flow::Continue
}
