//! Group conversation logs
//!
//! One append-only file per group, named `<group_id>` under the `gm/`
//! directory, records `msg_id|from_id|payload|ts`. There is no read flag and
//! no per-user view; membership gates both writing and reading. The id
//! counter is not persisted separately — opening the store scans the logs
//! and resumes one past the largest id found.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use super::accounts::AccountStore;
use super::groups::GroupStore;
use super::pm::HistoryEntry;
use super::{append_line, read_lines, unix_ts};

const HISTORY_LIMIT_MAX: usize = 100;

#[derive(Error, Debug)]
pub enum GmError {
    #[error("no such group")]
    NotFound,
    #[error("caller is not a member of the group")]
    NotMember,
    #[error("group message store state is inconsistent")]
    Internal,
    #[error("group message store i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct GmRecord {
    msg_id: i64,
    from_id: i64,
    payload: String,
    ts: i64,
}

impl GmRecord {
    fn parse(line: &str) -> Option<GmRecord> {
        let mut fields = line.split('|');
        let rec = GmRecord {
            msg_id: fields.next()?.parse().ok()?,
            from_id: fields.next()?.parse().ok()?,
            payload: fields.next()?.to_owned(),
            ts: fields.next()?.parse().ok()?,
        };
        if fields.next().is_some() {
            return None;
        }
        Some(rec)
    }

    fn render(&self) -> String {
        format!("{}|{}|{}|{}", self.msg_id, self.from_id, self.payload, self.ts)
    }
}

pub struct GmStore {
    dir: PathBuf,
    next_msg_id: Mutex<i64>,
}

impl GmStore {
    /// Open the `gm/` directory and recover the id counter from the logs.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GmError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut next = 1;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().parse::<i64>().is_err() {
                continue;
            }
            for line in read_lines(&entry.path())? {
                if let Some(rec) = GmRecord::parse(&line) {
                    next = next.max(rec.msg_id + 1);
                }
            }
        }
        Ok(Self {
            dir,
            next_msg_id: Mutex::new(next),
        })
    }

    /// Append a message to the group log; the sender must be a member.
    pub fn send(
        &self,
        accounts: &AccountStore,
        groups: &GroupStore,
        from_id: i64,
        group_id: i64,
        payload: &str,
    ) -> Result<(i64, i64), GmError> {
        if payload.is_empty() {
            return Err(GmError::Internal);
        }
        self.check_access(accounts, groups, from_id, group_id)?;

        let mut counter = self.next_msg_id.lock().unwrap();
        let msg_id = *counter;
        let ts = unix_ts();
        let rec = GmRecord {
            msg_id,
            from_id,
            payload: payload.to_owned(),
            ts,
        };
        append_line(&self.dir.join(group_id.to_string()), &rec.render())?;
        *counter += 1;
        Ok((msg_id, ts))
    }

    /// Most-recent-first history, members only, `limit` clamped to 1..=100.
    pub fn history(
        &self,
        accounts: &AccountStore,
        groups: &GroupStore,
        viewer_id: i64,
        group_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, GmError> {
        self.check_access(accounts, groups, viewer_id, group_id)?;
        let limit = limit.clamp(1, HISTORY_LIMIT_MAX);

        let _guard = self.next_msg_id.lock().unwrap();
        let lines = read_lines(&self.dir.join(group_id.to_string()))?;
        let records: Vec<GmRecord> = lines.iter().filter_map(|l| GmRecord::parse(l)).collect();
        drop(_guard);

        let mut out = Vec::new();
        for rec in records.into_iter().rev().take(limit) {
            let from = accounts
                .username_of(rec.from_id)
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".to_owned());
            out.push(HistoryEntry {
                msg_id: rec.msg_id,
                from,
                payload: rec.payload,
                ts: rec.ts,
            });
        }
        Ok(out)
    }

    fn check_access(
        &self,
        accounts: &AccountStore,
        groups: &GroupStore,
        user_id: i64,
        group_id: i64,
    ) -> Result<(), GmError> {
        match groups.get(group_id) {
            Ok(Some(_)) => {}
            _ => return Err(GmError::NotFound),
        }
        let username = accounts
            .username_of(user_id)
            .ok()
            .flatten()
            .ok_or(GmError::Internal)?;
        match groups.is_member(group_id, &username) {
            Ok(true) => Ok(()),
            Ok(false) => Err(GmError::NotMember),
            Err(_) => Err(GmError::Internal),
        }
    }
}
