//! In-memory session registry
//!
//! Maps opaque tokens to authenticated users and their connections. A
//! session also carries the user's chat-mode hints — which 1:1 conversation
//! or group they are currently viewing — which is what decides whether a
//! message gets pushed live or waits in history.
//!
//! Policy: one active session per user, one per connection, idle timeout
//! with lazy reaping. Every operation serializes through one mutex. The
//! outbound sender held per session is only a handle; the connection behind
//! it may die at any moment, and pushes through a stale handle fail
//! silently.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;

pub const TOKEN_LEN: usize = 32;
const TOKEN_RETRIES: usize = 10;

/// Identifies one accepted TCP connection for the lifetime of the process.
pub type ConnId = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("user already has an active session")]
    AlreadyLoggedIn,
    #[error("no such session")]
    NotFound,
    #[error("session expired")]
    Expired,
}

#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub conn_id: ConnId,
    pub outbound: mpsc::Sender<String>,
    pub created_at: Instant,
    last_activity: Instant,
    chat_partner_id: i64,
    chat_group_id: i64,
}

impl Session {
    fn expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<String, Session>,
    user_token: HashMap<i64, String>,
    conn_token: HashMap<ConnId, String>,
}

impl Inner {
    fn reap(&mut self, timeout: Duration) -> usize {
        let dead: Vec<String> = self
            .by_token
            .iter()
            .filter(|(_, s)| s.expired(timeout))
            .map(|(t, _)| t.clone())
            .collect();
        let count = dead.len();
        for token in dead {
            self.evict(&token);
        }
        count
    }

    fn evict(&mut self, token: &str) -> Option<Session> {
        let session = self.by_token.remove(token)?;
        self.user_token.remove(&session.user_id);
        self.conn_token.remove(&session.conn_id);
        Some(session)
    }
}

pub struct SessionRegistry {
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a session for `user_id` bound to `conn_id`.
    ///
    /// Any previous session on the same connection is replaced first; a live
    /// session for the same user on another connection is a conflict.
    pub fn create(
        &self,
        user_id: i64,
        conn_id: ConnId,
        outbound: mpsc::Sender<String>,
    ) -> Result<String, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reap(self.timeout);

        if let Some(token) = inner.conn_token.get(&conn_id).cloned() {
            inner.evict(&token);
        }
        if inner.user_token.contains_key(&user_id) {
            return Err(SessionError::AlreadyLoggedIn);
        }

        let mut token = generate_token();
        for _ in 0..TOKEN_RETRIES {
            if !inner.by_token.contains_key(&token) {
                break;
            }
            token = generate_token();
        }

        let now = Instant::now();
        inner.user_token.insert(user_id, token.clone());
        inner.conn_token.insert(conn_id, token.clone());
        inner.by_token.insert(
            token.clone(),
            Session {
                token: token.clone(),
                user_id,
                conn_id,
                outbound,
                created_at: now,
                last_activity: now,
                chat_partner_id: 0,
                chat_group_id: 0,
            },
        );
        Ok(token)
    }

    /// Resolve a token to its user, refreshing the idle deadline.
    pub fn validate(&self, token: &str) -> Result<i64, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.by_token.get_mut(token) else {
            return Err(SessionError::NotFound);
        };
        if session.expired(self.timeout) {
            inner.evict(token);
            return Err(SessionError::Expired);
        }
        session.last_activity = Instant::now();
        let user_id = session.user_id;
        inner.reap(self.timeout);
        Ok(user_id)
    }

    /// Explicit logout; returns the evicted session.
    pub fn destroy(&self, token: &str) -> Result<Session, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict(token).ok_or(SessionError::NotFound)
    }

    /// Invalidate whatever session is bound to a closed connection.
    pub fn remove_by_connection(&self, conn_id: ConnId) -> Option<Session> {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.conn_token.get(&conn_id).cloned()?;
        inner.evict(&token)
    }

    /// Drop expired sessions; returns how many were evicted.
    pub fn reap_expired(&self) -> usize {
        self.inner.lock().unwrap().reap(self.timeout)
    }

    pub fn is_user_online(&self, user_id: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.reap(self.timeout);
        inner.user_token.contains_key(&user_id)
    }

    /// Outbound handle for a user's live connection, if any.
    pub fn push_handle(&self, user_id: i64) -> Option<mpsc::Sender<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.reap(self.timeout);
        let token = inner.user_token.get(&user_id)?.clone();
        Some(inner.by_token.get(&token)?.outbound.clone())
    }

    /// Outbound handle for `user_id`, but only while they are viewing the
    /// 1:1 conversation with `partner_id`.
    pub fn push_if_chatting_with(
        &self,
        user_id: i64,
        partner_id: i64,
    ) -> Option<mpsc::Sender<String>> {
        self.with_session(user_id, |s| {
            (s.chat_partner_id == partner_id).then(|| s.outbound.clone())
        })
        .flatten()
    }

    /// Outbound handle for `user_id`, but only while they are viewing
    /// group `group_id`.
    pub fn push_if_in_group_chat(
        &self,
        user_id: i64,
        group_id: i64,
    ) -> Option<mpsc::Sender<String>> {
        self.with_session(user_id, |s| {
            (s.chat_group_id == group_id).then(|| s.outbound.clone())
        })
        .flatten()
    }

    /// Enter (partner id) or leave (0) 1:1 chat mode.
    pub fn set_chat_partner(&self, user_id: i64, partner_id: i64) {
        self.with_session_mut(user_id, |s| s.chat_partner_id = partner_id);
    }

    pub fn chat_partner(&self, user_id: i64) -> i64 {
        self.with_session(user_id, |s| s.chat_partner_id).unwrap_or(0)
    }

    /// Enter (group id) or leave (0) group chat mode.
    pub fn set_chat_group(&self, user_id: i64, group_id: i64) {
        self.with_session_mut(user_id, |s| s.chat_group_id = group_id);
    }

    pub fn chat_group(&self, user_id: i64) -> i64 {
        self.with_session(user_id, |s| s.chat_group_id).unwrap_or(0)
    }

    fn with_session<T>(&self, user_id: i64, f: impl FnOnce(&Session) -> T) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.reap(self.timeout);
        let token = inner.user_token.get(&user_id)?.clone();
        inner.by_token.get(&token).map(f)
    }

    fn with_session_mut(&self, user_id: i64, f: impl FnOnce(&mut Session)) {
        let mut inner = self.inner.lock().unwrap();
        inner.reap(self.timeout);
        if let Some(token) = inner.user_token.get(&user_id).cloned() {
            if let Some(session) = inner.by_token.get_mut(&token) {
                f(session);
            }
        }
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<String> {
        mpsc::channel(8).0
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_create_and_validate() {
        let reg = registry();
        let token = reg.create(1, 10, sender()).unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(reg.validate(&token), Ok(1));
        assert!(reg.is_user_online(1));
    }

    #[test]
    fn test_single_login_policy() {
        let reg = registry();
        let _token = reg.create(1, 10, sender()).unwrap();
        assert_eq!(reg.create(1, 11, sender()), Err(SessionError::AlreadyLoggedIn));
        // a different user on the other connection is fine
        reg.create(2, 11, sender()).unwrap();
    }

    #[test]
    fn test_relogin_on_same_connection_replaces() {
        let reg = registry();
        let old = reg.create(1, 10, sender()).unwrap();
        let new = reg.create(2, 10, sender()).unwrap();
        assert_eq!(reg.validate(&old), Err(SessionError::NotFound));
        assert_eq!(reg.validate(&new), Ok(2));
        assert!(!reg.is_user_online(1));
    }

    #[test]
    fn test_destroy() {
        let reg = registry();
        let token = reg.create(1, 10, sender()).unwrap();
        assert_eq!(reg.destroy(&token).unwrap().user_id, 1);
        assert_eq!(reg.validate(&token), Err(SessionError::NotFound));
        assert!(matches!(reg.destroy(&token), Err(SessionError::NotFound)));
    }

    #[test]
    fn test_remove_by_connection() {
        let reg = registry();
        let token = reg.create(1, 10, sender()).unwrap();
        let removed = reg.remove_by_connection(10).unwrap();
        assert_eq!(removed.user_id, 1);
        assert_eq!(reg.validate(&token), Err(SessionError::NotFound));
        assert!(reg.remove_by_connection(10).is_none());
    }

    #[test]
    fn test_expiry() {
        let reg = SessionRegistry::new(Duration::ZERO);
        let token = reg.create(1, 10, sender()).unwrap();
        assert_eq!(reg.validate(&token), Err(SessionError::Expired));
        // evicted on first touch
        assert_eq!(reg.validate(&token), Err(SessionError::NotFound));
        assert!(!reg.is_user_online(1));
    }

    #[test]
    fn test_chat_mode_routing() {
        let reg = registry();
        reg.create(1, 10, sender()).unwrap();
        reg.create(2, 11, sender()).unwrap();

        assert!(reg.push_if_chatting_with(2, 1).is_none());
        reg.set_chat_partner(2, 1);
        assert_eq!(reg.chat_partner(2), 1);
        assert!(reg.push_if_chatting_with(2, 1).is_some());
        assert!(reg.push_if_chatting_with(2, 3).is_none());
        reg.set_chat_partner(2, 0);
        assert!(reg.push_if_chatting_with(2, 1).is_none());

        reg.set_chat_group(1, 7);
        assert!(reg.push_if_in_group_chat(1, 7).is_some());
        assert!(reg.push_if_in_group_chat(1, 8).is_none());
        assert_eq!(reg.chat_group(1), 7);
    }

    #[test]
    fn test_push_handle_only_while_online() {
        let reg = registry();
        assert!(reg.push_handle(1).is_none());
        reg.create(1, 10, sender()).unwrap();
        assert!(reg.push_handle(1).is_some());
        reg.remove_by_connection(10);
        assert!(reg.push_handle(1).is_none());
    }
}
