//! Private conversation logs
//!
//! One append-only file per unordered user pair, named `<min_id>_<max_id>`
//! under the `pm/` directory. Records are
//! `msg_id|from_id|payload|ts|read_flag`; the payload is the opaque
//! client-encoded token and is never inspected here. Message ids come from a
//! process-wide counter persisted to `pm/.msg_id` after every allocation, so
//! ids stay unique across restarts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use super::accounts::AccountStore;
use super::{append_line, read_lines, unix_ts, write_replace};

const COUNTER_FILE: &str = ".msg_id";
const HISTORY_LIMIT_MAX: usize = 100;
pub const HISTORY_LIMIT_DEFAULT: usize = 50;

#[derive(Error, Debug)]
pub enum PmError {
    #[error("cannot message yourself")]
    SelfOp,
    #[error("no such user")]
    NotFound,
    #[error("message store state is inconsistent")]
    Internal,
    #[error("message store i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct PmRecord {
    msg_id: i64,
    from_id: i64,
    payload: String,
    ts: i64,
    read: bool,
}

impl PmRecord {
    fn parse(line: &str) -> Option<PmRecord> {
        let mut fields = line.split('|');
        let rec = PmRecord {
            msg_id: fields.next()?.parse().ok()?,
            from_id: fields.next()?.parse().ok()?,
            payload: fields.next()?.to_owned(),
            ts: fields.next()?.parse().ok()?,
            read: fields.next()? == "1",
        };
        if fields.next().is_some() {
            return None;
        }
        Some(rec)
    }

    fn render(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.msg_id,
            self.from_id,
            self.payload,
            self.ts,
            if self.read { 1 } else { 0 }
        )
    }
}

/// A resolved history entry ready for wire formatting.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub msg_id: i64,
    pub from: String,
    pub payload: String,
    pub ts: i64,
}

pub struct PmStore {
    dir: PathBuf,
    // guards both the log files and the persisted id counter
    next_msg_id: Mutex<i64>,
}

impl PmStore {
    /// Open the `pm/` directory, creating it and loading the id counter.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PmError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next = match fs::read_to_string(dir.join(COUNTER_FILE)) {
            Ok(text) => text.trim().parse().unwrap_or(1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dir,
            next_msg_id: Mutex::new(next),
        })
    }

    /// Append a message, returning its id and timestamp.
    pub fn send(
        &self,
        accounts: &AccountStore,
        from_id: i64,
        to_username: &str,
        payload: &str,
    ) -> Result<(i64, i64), PmError> {
        let from = match accounts.find_by_id(from_id) {
            Ok(Some(rec)) => rec,
            _ => return Err(PmError::Internal),
        };
        if from.username == to_username {
            return Err(PmError::SelfOp);
        }
        let to = match accounts.find_by_username(to_username) {
            Ok(Some(rec)) => rec,
            _ => return Err(PmError::NotFound),
        };
        if payload.is_empty() {
            return Err(PmError::Internal);
        }

        let mut counter = self.next_msg_id.lock().unwrap();
        let msg_id = *counter;
        let ts = unix_ts();
        let rec = PmRecord {
            msg_id,
            from_id,
            payload: payload.to_owned(),
            ts,
            read: false,
        };
        append_line(&self.pair_path(from_id, to.id), &rec.render())?;
        *counter += 1;
        fs::write(self.dir.join(COUNTER_FILE), counter.to_string())?;
        Ok((msg_id, ts))
    }

    /// Most-recent-first history with `other_username`, at most `limit`
    /// entries (clamped to 1..=100). A missing log file is an empty history.
    pub fn history(
        &self,
        accounts: &AccountStore,
        viewer_id: i64,
        other_username: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, PmError> {
        let other = match accounts.find_by_username(other_username) {
            Ok(Some(rec)) => rec,
            _ => return Err(PmError::NotFound),
        };
        let viewer = accounts
            .username_of(viewer_id)
            .ok()
            .flatten()
            .ok_or(PmError::Internal)?;
        let limit = limit.clamp(1, HISTORY_LIMIT_MAX);

        let _guard = self.next_msg_id.lock().unwrap();
        let records = load_records(&self.pair_path(viewer_id, other.id))?;
        Ok(records
            .into_iter()
            .rev()
            .take(limit)
            .map(|r| HistoryEntry {
                msg_id: r.msg_id,
                from: if r.from_id == viewer_id {
                    viewer.clone()
                } else {
                    other.username.clone()
                },
                payload: r.payload,
                ts: r.ts,
            })
            .collect())
    }

    /// Every conversation involving the user, with its unread count.
    pub fn conversations(
        &self,
        accounts: &AccountStore,
        user_id: i64,
    ) -> Result<Vec<(String, usize)>, PmError> {
        let mut counts = Vec::new();
        {
            let _guard = self.next_msg_id.lock().unwrap();
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(other_id) = pair_peer(&name.to_string_lossy(), user_id) else {
                    continue;
                };
                let unread = load_records(&entry.path())?
                    .iter()
                    .filter(|r| r.from_id == other_id && !r.read)
                    .count();
                counts.push((other_id, unread));
            }
        }

        // resolve names outside the store lock
        let mut out = Vec::new();
        for (other_id, unread) in counts {
            if let Ok(Some(other)) = accounts.username_of(other_id) {
                out.push((other, unread));
            }
        }
        Ok(out)
    }

    /// Mark everything the other side sent as read. Idempotent.
    pub fn mark_read(
        &self,
        accounts: &AccountStore,
        viewer_id: i64,
        other_username: &str,
    ) -> Result<(), PmError> {
        let other = match accounts.find_by_username(other_username) {
            Ok(Some(rec)) => rec,
            _ => return Err(PmError::NotFound),
        };

        let _guard = self.next_msg_id.lock().unwrap();
        let path = self.pair_path(viewer_id, other.id);
        if !path.exists() {
            return Ok(());
        }
        let mut records = load_records(&path)?;
        for rec in &mut records {
            if rec.from_id == other.id {
                rec.read = true;
            }
        }
        let mut out = String::new();
        for rec in &records {
            out.push_str(&rec.render());
            out.push('\n');
        }
        write_replace(&path, &out)?;
        Ok(())
    }

    fn pair_path(&self, a: i64, b: i64) -> PathBuf {
        let (min, max) = if a < b { (a, b) } else { (b, a) };
        self.dir.join(format!("{min}_{max}"))
    }
}

fn load_records(path: &Path) -> Result<Vec<PmRecord>, PmError> {
    let lines = read_lines(path)?;
    Ok(lines.iter().filter_map(|l| PmRecord::parse(l)).collect())
}

/// For a file named `<min>_<max>`, return the other user id if `user_id` is
/// one of the pair.
fn pair_peer(file_name: &str, user_id: i64) -> Option<i64> {
    let (a, b) = file_name.split_once('_')?;
    let a: i64 = a.parse().ok()?;
    let b: i64 = b.parse().ok()?;
    if a == user_id {
        Some(b)
    } else if b == user_id {
        Some(a)
    } else {
        None
    }
}
