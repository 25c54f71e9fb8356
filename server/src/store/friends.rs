//! Friendship edges
//!
//! Backed by `friends.db`, one directed edge per line:
//! `from|to|STATUS|ts`. An invitation is a PENDING edge pointing at the
//! invitee; accepting rewrites it to ACCEPTED, after which the relation is
//! symmetric. Rejecting or unfriending removes the edge entirely, so a
//! REJECTED status never reaches disk.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use super::accounts::AccountStore;
use super::{append_line, read_lines, unix_ts, write_replace};

#[derive(Error, Debug)]
pub enum FriendError {
    #[error("operation targets the caller itself")]
    SelfOp,
    #[error("no such user or invitation")]
    NotFound,
    #[error("edge already present")]
    Exists,
    #[error("friendship store state is inconsistent")]
    Internal,
    #[error("friendship store i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Accepted,
}

#[derive(Debug, Clone)]
struct Edge {
    from: String,
    to: String,
    status: Status,
    ts: i64,
}

impl Edge {
    fn parse(line: &str) -> Option<Edge> {
        let mut fields = line.split('|');
        let from = fields.next()?.to_owned();
        let to = fields.next()?.to_owned();
        let status = match fields.next()? {
            "PENDING" => Status::Pending,
            "ACCEPTED" => Status::Accepted,
            _ => return None,
        };
        let ts = fields.next()?.parse().ok()?;
        if fields.next().is_some() || from.is_empty() || to.is_empty() {
            return None;
        }
        Some(Edge { from, to, status, ts })
    }

    fn render(&self) -> String {
        let status = match self.status {
            Status::Pending => "PENDING",
            Status::Accepted => "ACCEPTED",
        };
        format!("{}|{}|{}|{}", self.from, self.to, status, self.ts)
    }

    fn touches(&self, a: &str, b: &str) -> bool {
        (self.from == a && self.to == b) || (self.from == b && self.to == a)
    }
}

pub struct FriendStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FriendStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FriendError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Create a PENDING edge from `from_id`'s user towards `to_username`.
    pub fn invite(
        &self,
        accounts: &AccountStore,
        from_id: i64,
        to_username: &str,
    ) -> Result<(), FriendError> {
        let me = active_username(accounts, from_id)?;
        if me == to_username {
            return Err(FriendError::SelfOp);
        }
        match accounts.find_by_username(to_username) {
            Ok(Some(rec)) if rec.active => {}
            _ => return Err(FriendError::NotFound),
        }

        let _guard = self.lock.lock().unwrap();
        let edges = self.load()?;
        if edges.iter().any(|e| e.touches(&me, to_username)) {
            return Err(FriendError::Exists);
        }
        let edge = Edge {
            from: me,
            to: to_username.to_owned(),
            status: Status::Pending,
            ts: unix_ts(),
        };
        append_line(&self.path, &edge.render())?;
        Ok(())
    }

    /// Promote the PENDING edge `from_username -> me` to ACCEPTED.
    pub fn accept(
        &self,
        accounts: &AccountStore,
        to_id: i64,
        from_username: &str,
    ) -> Result<(), FriendError> {
        let me = active_username(accounts, to_id)?;
        if me == from_username {
            return Err(FriendError::SelfOp);
        }

        let _guard = self.lock.lock().unwrap();
        let mut edges = self.load()?;
        let target = edges
            .iter()
            .position(|e| e.from == from_username && e.to == me && e.status == Status::Pending);
        match target {
            Some(i) => {
                edges[i].status = Status::Accepted;
                edges[i].ts = unix_ts();
            }
            None => {
                // distinguish "already friends" from "no invitation"
                if edges
                    .iter()
                    .any(|e| e.touches(&me, from_username) && e.status == Status::Accepted)
                {
                    return Err(FriendError::Exists);
                }
                return Err(FriendError::NotFound);
            }
        }
        self.save(&edges)
    }

    /// Drop the PENDING edge `from_username -> me`.
    pub fn reject(
        &self,
        accounts: &AccountStore,
        to_id: i64,
        from_username: &str,
    ) -> Result<(), FriendError> {
        let me = active_username(accounts, to_id)?;
        if me == from_username {
            return Err(FriendError::SelfOp);
        }

        let _guard = self.lock.lock().unwrap();
        let edges = self.load()?;
        let before = edges.len();
        let kept: Vec<Edge> = edges
            .into_iter()
            .filter(|e| {
                !(e.from == from_username && e.to == me && e.status == Status::Pending)
            })
            .collect();
        if kept.len() == before {
            return Err(FriendError::NotFound);
        }
        self.save(&kept)
    }

    /// Usernames with a PENDING invitation towards `user_id`.
    pub fn pending(&self, accounts: &AccountStore, user_id: i64) -> Result<Vec<String>, FriendError> {
        let me = active_username(accounts, user_id)?;
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.to == me && e.status == Status::Pending)
            .map(|e| e.from)
            .collect())
    }

    /// Usernames joined to `user_id` by an ACCEPTED edge in either direction.
    pub fn list(&self, accounts: &AccountStore, user_id: i64) -> Result<Vec<String>, FriendError> {
        let me = active_username(accounts, user_id)?;
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.status == Status::Accepted && (e.from == me || e.to == me))
            .map(|e| if e.from == me { e.to } else { e.from })
            .collect())
    }

    /// Remove the ACCEPTED edge between `user_id` and `other_username`.
    pub fn delete(
        &self,
        accounts: &AccountStore,
        user_id: i64,
        other_username: &str,
    ) -> Result<(), FriendError> {
        let me = active_username(accounts, user_id)?;
        if me == other_username {
            return Err(FriendError::SelfOp);
        }

        let _guard = self.lock.lock().unwrap();
        let edges = self.load()?;
        let before = edges.len();
        let kept: Vec<Edge> = edges
            .into_iter()
            .filter(|e| !(e.touches(&me, other_username) && e.status == Status::Accepted))
            .collect();
        if kept.len() == before {
            return Err(FriendError::NotFound);
        }
        self.save(&kept)
    }

    fn load(&self) -> Result<Vec<Edge>, FriendError> {
        let lines = read_lines(&self.path)?;
        Ok(lines.iter().filter_map(|l| Edge::parse(l)).collect())
    }

    fn save(&self, edges: &[Edge]) -> Result<(), FriendError> {
        let mut out = String::new();
        for e in edges {
            out.push_str(&e.render());
            out.push('\n');
        }
        write_replace(&self.path, &out)?;
        Ok(())
    }
}

fn active_username(accounts: &AccountStore, user_id: i64) -> Result<String, FriendError> {
    match accounts.find_by_id(user_id) {
        Ok(Some(rec)) if rec.active => Ok(rec.username),
        _ => Err(FriendError::Internal),
    }
}
