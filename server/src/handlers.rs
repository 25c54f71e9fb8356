//! Verb router and request handlers
//!
//! Every handler follows the same skeleton: pull the required `key=value`
//! arguments (missing ⇒ 400), validate the session token where the verb
//! needs one (⇒ 401), call the store, translate the result to an OK payload
//! or a wire error code, and finally emit any push frames to *other*
//! connections through their session push handles. Pushes are best-effort;
//! a dead recipient connection never fails the originating request.

use std::sync::Arc;

use parley_shared::{fmt_err, fmt_ok, fmt_push, PushSubject, Request};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sessions::ConnId;
use crate::state::ServerState;
use crate::store::accounts::AccountError;
use crate::store::friends::FriendError;
use crate::store::gm::GmError;
use crate::store::groups::GroupError;
use crate::store::pm::{HistoryEntry, PmError, HISTORY_LIMIT_DEFAULT};

/// What the connection worker should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// The peer's write side is gone; the worker terminates.
struct Closed;

type HandlerResult = Result<Flow, Closed>;

/// Handle one framed request line.
pub async fn handle_line(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    tx: &mpsc::Sender<String>,
    line: &str,
) -> Flow {
    let out = Outbound { tx };

    let req = match Request::parse(line) {
        Ok(req) => req,
        Err(_) => {
            // not even a req_id to echo; the connection stays open
            return match out.err("0", 400, "bad_request").await {
                Ok(()) => Flow::Continue,
                Err(Closed) => Flow::Disconnect,
            };
        }
    };

    debug!("conn {}: {} {}", conn_id, req.verb, req.req_id);
    match dispatch(state, conn_id, &out, &req).await {
        Ok(flow) => flow,
        Err(Closed) => Flow::Disconnect,
    }
}

async fn dispatch(
    state: &Arc<ServerState>,
    conn_id: ConnId,
    out: &Outbound<'_>,
    req: &Request,
) -> HandlerResult {
    match req.verb.as_str() {
        "PING" => {
            out.ok(req, "pong=1").await?;
            Ok(Flow::Continue)
        }
        "REGISTER" => register(state, out, req).await,
        "LOGIN" => login(state, conn_id, out, req).await,
        "LOGOUT" => logout(state, out, req).await,
        "WHOAMI" => whoami(state, out, req).await,
        "DISCONNECT" => disconnect(state, out, req).await,
        "FRIEND_INVITE" => friend_invite(state, out, req).await,
        "FRIEND_ACCEPT" => friend_accept(state, out, req).await,
        "FRIEND_REJECT" => friend_reject(state, out, req).await,
        "FRIEND_PENDING" => friend_pending(state, out, req).await,
        "FRIEND_LIST" => friend_list(state, out, req).await,
        "FRIEND_DELETE" => friend_delete(state, out, req).await,
        "GROUP_CREATE" => group_create(state, out, req).await,
        "GROUP_LIST" => group_list(state, out, req).await,
        "GROUP_MEMBERS" => group_members(state, out, req).await,
        "GROUP_ADD" => group_add(state, out, req).await,
        "GROUP_REMOVE" => group_remove(state, out, req).await,
        "GROUP_LEAVE" => group_leave(state, out, req).await,
        "PM_CHAT_START" => pm_chat_start(state, out, req).await,
        "PM_CHAT_END" => pm_chat_end(state, out, req).await,
        "PM_SEND" => pm_send(state, out, req).await,
        "PM_HISTORY" => pm_history(state, out, req).await,
        "PM_CONVERSATIONS" => pm_conversations(state, out, req).await,
        "GM_CHAT_START" => gm_chat_start(state, out, req).await,
        "GM_CHAT_END" => gm_chat_end(state, out, req).await,
        "GM_SEND" => gm_send(state, out, req).await,
        "GM_HISTORY" => gm_history(state, out, req).await,
        _ => {
            out.err(&req.req_id, 404, "unknown_command").await?;
            Ok(Flow::Continue)
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound helpers
// ---------------------------------------------------------------------------

struct Outbound<'a> {
    tx: &'a mpsc::Sender<String>,
}

impl Outbound<'_> {
    async fn ok(&self, req: &Request, payload: &str) -> Result<(), Closed> {
        self.send(fmt_ok(&req.req_id, payload)).await
    }

    async fn err(&self, req_id: &str, code: u16, message: &str) -> Result<(), Closed> {
        self.send(fmt_err(req_id, code, message)).await
    }

    async fn send(&self, frame: String) -> Result<(), Closed> {
        self.tx.send(frame).await.map_err(|_| Closed)
    }
}

/// Fetch a required argument; answers 400 and yields `None` when absent.
async fn require<'r>(
    out: &Outbound<'_>,
    req: &'r Request,
    key: &str,
) -> Result<Option<&'r str>, Closed> {
    match req.arg(key).filter(|v| !v.is_empty()) {
        Some(v) => Ok(Some(v)),
        None => {
            out.err(&req.req_id, 400, "missing_fields").await?;
            Ok(None)
        }
    }
}

/// Validate the session token; answers 400/401 and yields `None` on failure.
async fn authed_user(
    state: &ServerState,
    out: &Outbound<'_>,
    req: &Request,
) -> Result<Option<i64>, Closed> {
    let Some(token) = req.arg("token").filter(|t| !t.is_empty()) else {
        out.err(&req.req_id, 400, "missing_fields").await?;
        return Ok(None);
    };
    match state.sessions.validate(token) {
        Ok(user_id) => Ok(Some(user_id)),
        Err(_) => {
            out.err(&req.req_id, 401, "invalid_token").await?;
            Ok(None)
        }
    }
}

/// Parse a `group_id` argument; answers 400 and yields `None` when invalid.
async fn parse_group_id(
    out: &Outbound<'_>,
    req: &Request,
    raw: &str,
) -> Result<Option<i64>, Closed> {
    match raw.parse::<i64>() {
        Ok(gid) if gid > 0 => Ok(Some(gid)),
        _ => {
            out.err(&req.req_id, 400, "invalid_group_id").await?;
            Ok(None)
        }
    }
}

fn username_of(state: &ServerState, user_id: i64) -> Option<String> {
    state.accounts.username_of(user_id).ok().flatten()
}

/// Message payloads ride inside the line protocol and the `|`-separated
/// record files, so they must stay single printable-ASCII tokens.
fn valid_payload_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x21..=0x7e).contains(&b) && b != b'|')
}

fn render_history(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}:{}:{}:{}", e.msg_id, e.from, e.payload, e.ts))
        .collect::<Vec<_>>()
        .join(",")
}

fn render_history_or_empty(entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        "empty".to_owned()
    } else {
        render_history(entries)
    }
}

/// Queue a push frame on another user's connection, best-effort.
fn push_frame(handle: Option<mpsc::Sender<String>>, frame: String) {
    if let Some(handle) = handle {
        let _ = handle.try_send(frame);
    }
}

// ---------------------------------------------------------------------------
// Accounts and sessions
// ---------------------------------------------------------------------------

async fn register(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(password) = require(out, req, "password").await? else {
        return Ok(Flow::Continue);
    };
    let Some(email) = require(out, req, "email").await? else {
        return Ok(Flow::Continue);
    };

    match state.accounts.register(username, password, email) {
        Ok(user_id) => {
            state
                .activity
                .event(&format!("user {username} registered (user_id={user_id})"));
            out.ok(req, &format!("user_id={user_id}")).await?;
        }
        Err(AccountError::Exists) => out.err(&req.req_id, 409, "username_exists").await?,
        Err(AccountError::Invalid) => out.err(&req.req_id, 422, "invalid_fields").await?,
        Err(e) => {
            warn!("REGISTER failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn login(
    state: &ServerState,
    conn_id: ConnId,
    out: &Outbound<'_>,
    req: &Request,
) -> HandlerResult {
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(password) = require(out, req, "password").await? else {
        return Ok(Flow::Continue);
    };

    let user_id = match state.accounts.authenticate(username, password) {
        Ok(id) => id,
        Err(AccountError::Io(e)) => {
            warn!("LOGIN failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
            return Ok(Flow::Continue);
        }
        Err(_) => {
            out.err(&req.req_id, 401, "invalid_credentials").await?;
            return Ok(Flow::Continue);
        }
    };

    match state.sessions.create(user_id, conn_id, out.tx.clone()) {
        Ok(token) => {
            state
                .activity
                .event(&format!("user {username} logged in (user_id={user_id})"));
            out.ok(req, &format!("token={token} user_id={user_id}")).await?;
        }
        Err(_) => out.err(&req.req_id, 409, "already_logged_in").await?,
    }
    Ok(Flow::Continue)
}

async fn logout(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(token) = require(out, req, "token").await? else {
        return Ok(Flow::Continue);
    };

    match state.sessions.destroy(token) {
        Ok(session) => {
            state.activity.event(&format!(
                "user_id={} logged out after {}s",
                session.user_id,
                session.created_at.elapsed().as_secs()
            ));
            out.ok(req, "ok=1").await?;
        }
        Err(_) => out.err(&req.req_id, 401, "invalid_token").await?,
    }
    Ok(Flow::Continue)
}

async fn whoami(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    out.ok(req, &format!("user_id={user_id}")).await?;
    Ok(Flow::Continue)
}

async fn disconnect(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    if let Some(token) = req.arg("token").filter(|t| !t.is_empty()) {
        if let Ok(session) = state.sessions.destroy(token) {
            state
                .activity
                .event(&format!("user_id={} disconnected", session.user_id));
        }
    }
    // best-effort farewell; the worker terminates either way
    let _ = out.ok(req, "ok=1").await;
    Ok(Flow::Disconnect)
}

// ---------------------------------------------------------------------------
// Friendships
// ---------------------------------------------------------------------------

async fn friend_invite(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.friends.invite(&state.accounts, user_id, username) {
        Ok(()) => {
            state
                .activity
                .event(&format!("friend invite user_id={user_id} -> {username}"));
            out.ok(req, &format!("username={username} status=pending")).await?;
        }
        Err(FriendError::SelfOp) => out.err(&req.req_id, 422, "cannot_invite_self").await?,
        Err(FriendError::NotFound) => out.err(&req.req_id, 404, "user_not_found").await?,
        Err(FriendError::Exists) => {
            out.err(&req.req_id, 409, "already_friend_or_pending").await?
        }
        Err(e) => {
            warn!("FRIEND_INVITE failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn friend_accept(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.friends.accept(&state.accounts, user_id, username) {
        Ok(()) => {
            state
                .activity
                .event(&format!("friend accept user_id={user_id} <- {username}"));
            out.ok(req, &format!("username={username} status=accepted")).await?;
        }
        Err(FriendError::SelfOp) => out.err(&req.req_id, 422, "cannot_accept_self").await?,
        Err(FriendError::NotFound) => out.err(&req.req_id, 404, "invite_not_found").await?,
        Err(FriendError::Exists) => out.err(&req.req_id, 409, "already_friends").await?,
        Err(e) => {
            warn!("FRIEND_ACCEPT failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn friend_reject(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.friends.reject(&state.accounts, user_id, username) {
        Ok(()) => {
            out.ok(req, &format!("username={username} status=rejected")).await?;
        }
        Err(FriendError::SelfOp) => out.err(&req.req_id, 422, "cannot_reject_self").await?,
        Err(FriendError::NotFound | FriendError::Exists) => {
            out.err(&req.req_id, 404, "invite_not_found").await?
        }
        Err(e) => {
            warn!("FRIEND_REJECT failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn friend_pending(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.friends.pending(&state.accounts, user_id) {
        Ok(names) => out.ok(req, &format!("username={}", names.join(","))).await?,
        Err(e) => {
            warn!("FRIEND_PENDING failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn friend_list(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.friends.list(&state.accounts, user_id) {
        Ok(names) => {
            let entries: Vec<String> = names
                .into_iter()
                .map(|name| {
                    let online = state
                        .accounts
                        .find_by_username(&name)
                        .ok()
                        .flatten()
                        .map(|rec| state.sessions.is_user_online(rec.id))
                        .unwrap_or(false);
                    let status = if online { "online" } else { "offline" };
                    format!("{name}:{status}")
                })
                .collect();
            out.ok(req, &format!("username={}", entries.join(","))).await?;
        }
        Err(e) => {
            warn!("FRIEND_LIST failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn friend_delete(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.friends.delete(&state.accounts, user_id, username) {
        Ok(()) => {
            state
                .activity
                .event(&format!("friend delete user_id={user_id} x {username}"));
            out.ok(req, &format!("username={username} status=deleted")).await?;
        }
        Err(FriendError::SelfOp) => out.err(&req.req_id, 422, "cannot_delete_self").await?,
        Err(FriendError::NotFound | FriendError::Exists) => {
            out.err(&req.req_id, 404, "friend_not_found").await?
        }
        Err(e) => {
            warn!("FRIEND_DELETE failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

async fn group_create(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(name) = require(out, req, "name").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    if name.contains('|') {
        out.err(&req.req_id, 400, "bad_request").await?;
        return Ok(Flow::Continue);
    }

    match state.groups.create(&state.accounts, user_id, name) {
        Ok(group_id) => {
            state.activity.event(&format!(
                "group {group_id} ({name}) created by user_id={user_id}"
            ));
            out.ok(req, &format!("group_id={group_id} name={name}")).await?;
        }
        Err(e) => {
            warn!("GROUP_CREATE failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn group_list(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.groups.list(&state.accounts, user_id) {
        Ok(ids) => {
            let joined = ids
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.ok(req, &format!("groups={joined}")).await?;
        }
        Err(e) => {
            warn!("GROUP_LIST failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn group_members(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };

    match state.groups.list_members(&state.accounts, user_id, group_id) {
        Ok(names) => out.ok(req, &format!("members={}", names.join(","))).await?,
        Err(GroupError::Permission) => out.err(&req.req_id, 403, "not_group_member").await?,
        Err(e) => {
            warn!("GROUP_MEMBERS failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn group_add(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };

    match state
        .groups
        .add_member(&state.accounts, user_id, group_id, username)
    {
        Ok(()) => {
            state.activity.event(&format!(
                "group {group_id}: {username} added by user_id={user_id}"
            ));
            notify_group_chat(state, group_id, username, PushSubject::GmJoin);
            out.ok(
                req,
                &format!("group_id={group_id} username={username} status=added"),
            )
            .await?;
        }
        Err(GroupError::NotFound) => out.err(&req.req_id, 404, "user_not_found").await?,
        Err(GroupError::Permission) => out.err(&req.req_id, 403, "not_group_owner").await?,
        Err(GroupError::Exists) => out.err(&req.req_id, 409, "already_member").await?,
        Err(e) => {
            warn!("GROUP_ADD failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn group_remove(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(username) = require(out, req, "username").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };

    match state
        .groups
        .remove_member(&state.accounts, user_id, group_id, username)
    {
        Ok(()) => {
            state.activity.event(&format!(
                "group {group_id}: {username} removed by user_id={user_id}"
            ));
            // tell the removed user first, while their chat mode still points here
            if let Ok(Some(removed)) = state.accounts.find_by_username(username) {
                push_frame(
                    state.sessions.push_if_in_group_chat(removed.id, group_id),
                    fmt_push(PushSubject::GmKicked, &format!("group_id={group_id}")),
                );
                if state.sessions.chat_group(removed.id) == group_id {
                    state.sessions.set_chat_group(removed.id, 0);
                }
            }
            notify_group_chat(state, group_id, username, PushSubject::GmLeave);
            out.ok(
                req,
                &format!("group_id={group_id} username={username} status=removed"),
            )
            .await?;
        }
        Err(GroupError::Permission) => out.err(&req.req_id, 403, "not_group_owner").await?,
        Err(GroupError::NotFound) => out.err(&req.req_id, 404, "member_not_found").await?,
        Err(e) => {
            warn!("GROUP_REMOVE failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn group_leave(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };

    match state.groups.leave(&state.accounts, user_id, group_id) {
        Ok(()) => {
            let name = username_of(state, user_id).unwrap_or_default();
            state
                .activity
                .event(&format!("group {group_id}: {name} left"));
            if state.sessions.chat_group(user_id) == group_id {
                state.sessions.set_chat_group(user_id, 0);
            }
            notify_group_chat(state, group_id, &name, PushSubject::GmLeave);
            out.ok(req, &format!("group_id={group_id} status=left")).await?;
        }
        Err(GroupError::SelfOp) => out.err(&req.req_id, 422, "owner_cannot_leave").await?,
        Err(GroupError::NotFound) => out.err(&req.req_id, 404, "not_group_member").await?,
        Err(e) => {
            warn!("GROUP_LEAVE failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

/// Notify every member currently in `group_id`'s chat mode that `subject`
/// happened to `about_username`; the subject user itself is skipped.
fn notify_group_chat(
    state: &ServerState,
    group_id: i64,
    about_username: &str,
    subject: PushSubject,
) {
    let Ok(members) = state.groups.members(group_id) else {
        return;
    };
    let frame = fmt_push(
        subject,
        &format!("user={about_username} group_id={group_id}"),
    );
    for member in members {
        if member == about_username {
            continue;
        }
        let Ok(Some(rec)) = state.accounts.find_by_username(&member) else {
            continue;
        };
        push_frame(
            state.sessions.push_if_in_group_chat(rec.id, group_id),
            frame.clone(),
        );
    }
}

// ---------------------------------------------------------------------------
// Private messages
// ---------------------------------------------------------------------------

async fn pm_chat_start(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(with) = require(out, req, "with").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    let other = match state.accounts.find_by_username(with) {
        Ok(Some(rec)) => rec,
        Ok(None) => {
            out.err(&req.req_id, 404, "user_not_found").await?;
            return Ok(Flow::Continue);
        }
        Err(e) => {
            warn!("PM_CHAT_START failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
            return Ok(Flow::Continue);
        }
    };
    let Some(me) = username_of(state, user_id) else {
        out.err(&req.req_id, 500, "server_error").await?;
        return Ok(Flow::Continue);
    };

    if let Err(e) = state.pm.mark_read(&state.accounts, user_id, with) {
        warn!("PM_CHAT_START mark_read failed: {}", e);
        out.err(&req.req_id, 500, "server_error").await?;
        return Ok(Flow::Continue);
    }
    state.sessions.set_chat_partner(user_id, other.id);

    match state
        .pm
        .history(&state.accounts, user_id, with, HISTORY_LIMIT_DEFAULT)
    {
        Ok(entries) => {
            // if the partner is already looking at this conversation, tell them
            push_frame(
                state.sessions.push_if_chatting_with(other.id, user_id),
                fmt_push(PushSubject::Join, &format!("user={me}")),
            );
            out.ok(
                req,
                &format!(
                    "with={with} me={me} history={}",
                    render_history_or_empty(&entries)
                ),
            )
            .await?;
        }
        Err(e) => {
            warn!("PM_CHAT_START history failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn pm_chat_end(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    let partner = state.sessions.chat_partner(user_id);
    if partner != 0 {
        // catch anything that arrived while the window was open
        if let Some(partner_name) = username_of(state, partner) {
            let _ = state.pm.mark_read(&state.accounts, user_id, &partner_name);
        }
        state.sessions.set_chat_partner(user_id, 0);
        if let Some(me) = username_of(state, user_id) {
            push_frame(
                state.sessions.push_if_chatting_with(partner, user_id),
                fmt_push(PushSubject::Leave, &format!("user={me}")),
            );
        }
    }
    out.ok(req, "status=chat_ended").await?;
    Ok(Flow::Continue)
}

async fn pm_send(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(to) = require(out, req, "to").await? else {
        return Ok(Flow::Continue);
    };
    let Some(content) = require(out, req, "content").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    if !valid_payload_token(content) {
        out.err(&req.req_id, 422, "invalid_fields").await?;
        return Ok(Flow::Continue);
    }

    match state.pm.send(&state.accounts, user_id, to, content) {
        Ok((msg_id, ts)) => {
            state
                .activity
                .event(&format!("pm {msg_id} user_id={user_id} -> {to}"));
            // live push only while the recipient is viewing this conversation
            if let (Ok(Some(recipient)), Some(me)) = (
                state.accounts.find_by_username(to),
                username_of(state, user_id),
            ) {
                push_frame(
                    state.sessions.push_if_chatting_with(recipient.id, user_id),
                    fmt_push(
                        PushSubject::Pm,
                        &format!("from={me} content={content} msg_id={msg_id} ts={ts}"),
                    ),
                );
            }
            out.ok(req, &format!("msg_id={msg_id} to={to} status=sent")).await?;
        }
        Err(PmError::SelfOp) => out.err(&req.req_id, 422, "cannot_send_to_self").await?,
        Err(PmError::NotFound) => out.err(&req.req_id, 404, "user_not_found").await?,
        Err(e) => {
            warn!("PM_SEND failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn pm_history(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(with) = require(out, req, "with").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let limit = parse_limit(req);

    match state.pm.history(&state.accounts, user_id, with, limit) {
        Ok(entries) => {
            out.ok(req, &format!("with={with} messages={}", render_history(&entries)))
                .await?;
        }
        Err(PmError::NotFound) => out.err(&req.req_id, 404, "user_not_found").await?,
        Err(e) => {
            warn!("PM_HISTORY failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn pm_conversations(
    state: &ServerState,
    out: &Outbound<'_>,
    req: &Request,
) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    match state.pm.conversations(&state.accounts, user_id) {
        Ok(convs) => {
            let joined = convs
                .iter()
                .map(|(name, unread)| format!("{name}:{unread}"))
                .collect::<Vec<_>>()
                .join(",");
            out.ok(req, &format!("conversations={joined}")).await?;
        }
        Err(e) => {
            warn!("PM_CONVERSATIONS failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

// ---------------------------------------------------------------------------
// Group messages
// ---------------------------------------------------------------------------

async fn gm_chat_start(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };

    let group = match state.groups.get(group_id) {
        Ok(Some(rec)) => rec,
        Ok(None) => {
            out.err(&req.req_id, 404, "invalid_group_id").await?;
            return Ok(Flow::Continue);
        }
        Err(e) => {
            warn!("GM_CHAT_START failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
            return Ok(Flow::Continue);
        }
    };
    let Some(me) = username_of(state, user_id) else {
        out.err(&req.req_id, 500, "server_error").await?;
        return Ok(Flow::Continue);
    };
    match state.groups.is_member(group_id, &me) {
        Ok(true) => {}
        Ok(false) => {
            out.err(&req.req_id, 403, "not_group_member").await?;
            return Ok(Flow::Continue);
        }
        Err(e) => {
            warn!("GM_CHAT_START failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
            return Ok(Flow::Continue);
        }
    }

    // announce to members already in this group's chat, then join it
    notify_group_chat(state, group_id, &me, PushSubject::GmJoin);
    state.sessions.set_chat_group(user_id, group_id);

    match state
        .gm
        .history(&state.accounts, &state.groups, user_id, group_id, HISTORY_LIMIT_DEFAULT)
    {
        Ok(entries) => {
            out.ok(
                req,
                &format!(
                    "group_id={group_id} group_name={} me={me} history={}",
                    group.name,
                    render_history_or_empty(&entries)
                ),
            )
            .await?;
        }
        Err(e) => {
            warn!("GM_CHAT_START history failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

async fn gm_chat_end(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };

    let group_id = state.sessions.chat_group(user_id);
    if group_id != 0 {
        state.sessions.set_chat_group(user_id, 0);
        if let Some(me) = username_of(state, user_id) {
            notify_group_chat(state, group_id, &me, PushSubject::GmLeave);
        }
    }
    out.ok(req, "status=chat_ended").await?;
    Ok(Flow::Continue)
}

async fn gm_send(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(content) = require(out, req, "content").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };
    if !valid_payload_token(content) {
        out.err(&req.req_id, 400, "bad_request").await?;
        return Ok(Flow::Continue);
    }

    match state
        .gm
        .send(&state.accounts, &state.groups, user_id, group_id, content)
    {
        Ok((msg_id, ts)) => {
            state
                .activity
                .event(&format!("gm {msg_id} user_id={user_id} -> group {group_id}"));
            if let Some(me) = username_of(state, user_id) {
                fan_out_gm(state, group_id, user_id, &me, content, msg_id, ts);
            }
            out.ok(req, &format!("msg_id={msg_id} status=sent")).await?;
        }
        Err(GmError::NotFound) => out.err(&req.req_id, 404, "invalid_group_id").await?,
        Err(GmError::NotMember) => out.err(&req.req_id, 403, "not_group_member").await?,
        Err(e) => {
            warn!("GM_SEND failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

/// Deliver a fresh group message to every member who is in this group's
/// chat mode, except the sender.
fn fan_out_gm(
    state: &ServerState,
    group_id: i64,
    sender_id: i64,
    sender_name: &str,
    content: &str,
    msg_id: i64,
    ts: i64,
) {
    let Ok(members) = state.groups.members(group_id) else {
        return;
    };
    let frame = fmt_push(
        PushSubject::Gm,
        &format!("from={sender_name} group_id={group_id} content={content} msg_id={msg_id} ts={ts}"),
    );
    for member in members {
        let Ok(Some(rec)) = state.accounts.find_by_username(&member) else {
            continue;
        };
        if rec.id == sender_id {
            continue;
        }
        push_frame(
            state.sessions.push_if_in_group_chat(rec.id, group_id),
            frame.clone(),
        );
    }
}

async fn gm_history(state: &ServerState, out: &Outbound<'_>, req: &Request) -> HandlerResult {
    let Some(raw_gid) = require(out, req, "group_id").await? else {
        return Ok(Flow::Continue);
    };
    let Some(user_id) = authed_user(state, out, req).await? else {
        return Ok(Flow::Continue);
    };
    let Some(group_id) = parse_group_id(out, req, raw_gid).await? else {
        return Ok(Flow::Continue);
    };
    let limit = parse_limit(req);

    match state
        .gm
        .history(&state.accounts, &state.groups, user_id, group_id, limit)
    {
        Ok(entries) => {
            out.ok(
                req,
                &format!("group_id={group_id} messages={}", render_history(&entries)),
            )
            .await?;
        }
        Err(GmError::NotFound) => out.err(&req.req_id, 404, "invalid_group_id").await?,
        Err(GmError::NotMember) => out.err(&req.req_id, 403, "not_group_member").await?,
        Err(e) => {
            warn!("GM_HISTORY failed: {}", e);
            out.err(&req.req_id, 500, "server_error").await?;
        }
    }
    Ok(Flow::Continue)
}

fn parse_limit(req: &Request) -> usize {
    req.arg("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(HISTORY_LIMIT_DEFAULT)
}
