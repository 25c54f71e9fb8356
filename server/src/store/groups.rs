//! Chat groups and membership
//!
//! Two files: `groups.db` holds `group_id|name|owner|created_at`, and
//! `group_members.db` holds one `group_id|username` pair per member. The
//! owner is always a member and cannot leave; only the owner mutates the
//! member list. Group ids are allocated as max-existing-plus-one under the
//! store mutex, which stays strictly increasing because groups are never
//! deleted.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use super::accounts::AccountStore;
use super::{append_line, read_lines, unix_ts, write_replace};

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("the owner cannot leave its own group")]
    SelfOp,
    #[error("no such group, user or membership")]
    NotFound,
    #[error("already a member")]
    Exists,
    #[error("caller lacks permission")]
    Permission,
    #[error("group store state is inconsistent")]
    Internal,
    #[error("group store i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub created_at: i64,
}

impl GroupRecord {
    fn parse(line: &str) -> Option<GroupRecord> {
        let mut fields = line.split('|');
        let rec = GroupRecord {
            id: fields.next()?.parse().ok()?,
            name: fields.next()?.to_owned(),
            owner: fields.next()?.to_owned(),
            created_at: fields.next()?.parse().ok()?,
        };
        if fields.next().is_some() || rec.id <= 0 || rec.name.is_empty() {
            return None;
        }
        Some(rec)
    }

    fn render(&self) -> String {
        format!("{}|{}|{}|{}", self.id, self.name, self.owner, self.created_at)
    }
}

fn parse_member(line: &str) -> Option<(i64, String)> {
    let (gid, name) = line.split_once('|')?;
    let gid = gid.parse().ok()?;
    if name.is_empty() || name.contains('|') {
        return None;
    }
    Some((gid, name.to_owned()))
}

pub struct GroupStore {
    groups_path: PathBuf,
    members_path: PathBuf,
    lock: Mutex<()>,
}

impl GroupStore {
    pub fn open(
        groups_path: impl Into<PathBuf>,
        members_path: impl Into<PathBuf>,
    ) -> Result<Self, GroupError> {
        let groups_path = groups_path.into();
        let members_path = members_path.into();
        if let Some(dir) = groups_path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            groups_path,
            members_path,
            lock: Mutex::new(()),
        })
    }

    /// Create a group owned by `owner_id`'s user; returns the new group id.
    pub fn create(&self, accounts: &AccountStore, owner_id: i64, name: &str) -> Result<i64, GroupError> {
        if name.is_empty() || name.contains('|') {
            return Err(GroupError::Internal);
        }
        let owner = active_username(accounts, owner_id)?;

        let _guard = self.lock.lock().unwrap();
        let groups = self.load_groups()?;
        let id = groups.iter().map(|g| g.id).max().unwrap_or(0) + 1;
        let rec = GroupRecord {
            id,
            name: name.to_owned(),
            owner: owner.clone(),
            created_at: unix_ts(),
        };
        append_line(&self.groups_path, &rec.render())?;
        append_line(&self.members_path, &format!("{id}|{owner}"))?;
        Ok(id)
    }

    /// Group ids the user belongs to.
    pub fn list(&self, accounts: &AccountStore, user_id: i64) -> Result<Vec<i64>, GroupError> {
        let me = active_username(accounts, user_id)?;
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .load_members()?
            .into_iter()
            .filter(|(_, name)| *name == me)
            .map(|(gid, _)| gid)
            .collect())
    }

    /// Member usernames of a group; the caller must be a member itself.
    pub fn list_members(
        &self,
        accounts: &AccountStore,
        user_id: i64,
        group_id: i64,
    ) -> Result<Vec<String>, GroupError> {
        let me = active_username(accounts, user_id)?;
        let _guard = self.lock.lock().unwrap();
        let members = self.load_members()?;
        if !members.iter().any(|(gid, name)| *gid == group_id && *name == me) {
            return Err(GroupError::Permission);
        }
        Ok(members
            .into_iter()
            .filter(|(gid, _)| *gid == group_id)
            .map(|(_, name)| name)
            .collect())
    }

    /// Owner-only: add a user to the group.
    pub fn add_member(
        &self,
        accounts: &AccountStore,
        caller_id: i64,
        group_id: i64,
        username: &str,
    ) -> Result<(), GroupError> {
        let caller = active_username(accounts, caller_id)?;
        match accounts.find_by_username(username) {
            Ok(Some(rec)) if rec.active => {}
            _ => return Err(GroupError::NotFound),
        }

        let _guard = self.lock.lock().unwrap();
        if !self.is_owner_locked(group_id, &caller)? {
            return Err(GroupError::Permission);
        }
        let members = self.load_members()?;
        if members.iter().any(|(gid, name)| *gid == group_id && name == username) {
            return Err(GroupError::Exists);
        }
        append_line(&self.members_path, &format!("{group_id}|{username}"))?;
        Ok(())
    }

    /// Owner-only: remove a member from the group.
    pub fn remove_member(
        &self,
        accounts: &AccountStore,
        caller_id: i64,
        group_id: i64,
        username: &str,
    ) -> Result<(), GroupError> {
        let caller = active_username(accounts, caller_id)?;

        let _guard = self.lock.lock().unwrap();
        if !self.is_owner_locked(group_id, &caller)? {
            return Err(GroupError::Permission);
        }
        self.remove_membership_locked(group_id, username)
    }

    /// Leave a group. The owner cannot leave.
    pub fn leave(&self, accounts: &AccountStore, user_id: i64, group_id: i64) -> Result<(), GroupError> {
        let me = active_username(accounts, user_id)?;

        let _guard = self.lock.lock().unwrap();
        if self.is_owner_locked(group_id, &me)? {
            return Err(GroupError::SelfOp);
        }
        self.remove_membership_locked(group_id, &me)
    }

    /// Look up a group record by id.
    pub fn get(&self, group_id: i64) -> Result<Option<GroupRecord>, GroupError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load_groups()?.into_iter().find(|g| g.id == group_id))
    }

    /// Member usernames without a permission gate, for push fan-out.
    pub fn members(&self, group_id: i64) -> Result<Vec<String>, GroupError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .load_members()?
            .into_iter()
            .filter(|(gid, _)| *gid == group_id)
            .map(|(_, name)| name)
            .collect())
    }

    /// Whether `username` belongs to the group.
    pub fn is_member(&self, group_id: i64, username: &str) -> Result<bool, GroupError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .load_members()?
            .iter()
            .any(|(gid, name)| *gid == group_id && name == username))
    }

    fn is_owner_locked(&self, group_id: i64, username: &str) -> Result<bool, GroupError> {
        Ok(self
            .load_groups()?
            .iter()
            .any(|g| g.id == group_id && g.owner == username))
    }

    fn remove_membership_locked(&self, group_id: i64, username: &str) -> Result<(), GroupError> {
        let members = self.load_members()?;
        let before = members.len();
        let kept: Vec<(i64, String)> = members
            .into_iter()
            .filter(|(gid, name)| !(*gid == group_id && name == username))
            .collect();
        if kept.len() == before {
            return Err(GroupError::NotFound);
        }
        let mut out = String::new();
        for (gid, name) in &kept {
            out.push_str(&format!("{gid}|{name}\n"));
        }
        write_replace(&self.members_path, &out)?;
        Ok(())
    }

    fn load_groups(&self) -> Result<Vec<GroupRecord>, GroupError> {
        let lines = read_lines(&self.groups_path)?;
        Ok(lines.iter().filter_map(|l| GroupRecord::parse(l)).collect())
    }

    fn load_members(&self) -> Result<Vec<(i64, String)>, GroupError> {
        let lines = read_lines(&self.members_path)?;
        Ok(lines.iter().filter_map(|l| parse_member(l)).collect())
    }
}

fn active_username(accounts: &AccountStore, user_id: i64) -> Result<String, GroupError> {
    match accounts.find_by_id(user_id) {
        Ok(Some(rec)) if rec.active => Ok(rec.username),
        _ => Err(GroupError::Internal),
    }
}
