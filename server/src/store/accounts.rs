//! User account registry
//!
//! Backed by `users.db`, one user per line:
//! `id|username|salt|hash|email|active`. Passwords are never stored; each
//! record keeps a random hex salt and `hex(sha256(salt ":" password))`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{append_line, read_lines};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 6;
const PASSWORD_MAX: usize = 64;
const EMAIL_MIN: usize = 5;
const EMAIL_MAX: usize = 96;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("username already registered")]
    Exists,
    #[error("invalid account fields")]
    Invalid,
    #[error("no such user")]
    NotFound,
    #[error("wrong password")]
    BadPassword,
    #[error("account disabled")]
    Inactive,
    #[error("account store i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// One `users.db` record.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub salt: String,
    pub hash: String,
    pub email: String,
    pub active: bool,
}

impl UserRecord {
    fn parse(line: &str) -> Option<UserRecord> {
        let mut fields = line.split('|');
        let rec = UserRecord {
            id: fields.next()?.parse().ok()?,
            username: fields.next()?.to_owned(),
            salt: fields.next()?.to_owned(),
            hash: fields.next()?.to_owned(),
            email: fields.next()?.to_owned(),
            active: fields.next()? == "1",
        };
        // tolerate a partial trailing record, never a field surplus
        if fields.next().is_some() || rec.id <= 0 || rec.username.is_empty() {
            return None;
        }
        Some(rec)
    }

    fn render(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.id,
            self.username,
            self.salt,
            self.hash,
            self.email,
            if self.active { 1 } else { 0 }
        )
    }
}

pub struct AccountStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AccountStore {
    /// Open (creating if needed) the registry file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AccountError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Register a new user and return the assigned id.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<i64, AccountError> {
        if !valid_username(username) || !valid_password(password) || !valid_email(email) {
            return Err(AccountError::Invalid);
        }

        let _guard = self.lock.lock().unwrap();
        let records = self.load()?;
        if records.iter().any(|r| r.username == username) {
            return Err(AccountError::Exists);
        }

        let id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let salt = random_salt();
        let rec = UserRecord {
            id,
            username: username.to_owned(),
            salt: salt.clone(),
            hash: password_hash(&salt, password),
            email: email.to_owned(),
            active: true,
        };
        append_line(&self.path, &rec.render())?;
        Ok(id)
    }

    /// Verify credentials and return the user id.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<i64, AccountError> {
        if !valid_username(username) || !valid_password(password) {
            return Err(AccountError::Invalid);
        }

        let _guard = self.lock.lock().unwrap();
        let records = self.load()?;
        let rec = records
            .iter()
            .find(|r| r.username == username)
            .ok_or(AccountError::NotFound)?;
        if !rec.active {
            return Err(AccountError::Inactive);
        }
        if password_hash(&rec.salt, password) != rec.hash {
            return Err(AccountError::BadPassword);
        }
        Ok(rec.id)
    }

    /// Look a user up by name, regardless of active flag.
    pub fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AccountError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.into_iter().find(|r| r.username == username))
    }

    /// Look a user up by id, regardless of active flag.
    pub fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, AccountError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    /// Resolve an id to a username, for rendering message history.
    pub fn username_of(&self, id: i64) -> Result<Option<String>, AccountError> {
        Ok(self.find_by_id(id)?.map(|r| r.username))
    }

    fn load(&self) -> Result<Vec<UserRecord>, AccountError> {
        let lines = read_lines(&self.path)?;
        Ok(lines.iter().filter_map(|l| UserRecord::parse(l)).collect())
    }
}

fn valid_username(s: &str) -> bool {
    (USERNAME_MIN..=USERNAME_MAX).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_password(s: &str) -> bool {
    (PASSWORD_MIN..=PASSWORD_MAX).contains(&s.len()) && !s.contains(' ')
}

fn valid_email(s: &str) -> bool {
    if !(EMAIL_MIN..=EMAIL_MAX).contains(&s.len()) || s.contains(' ') || s.contains('|') {
        return false;
    }
    let Some(at) = s.find('@') else { return false };
    if at == 0 {
        return false;
    }
    let domain = &s[at + 1..];
    match domain.find('.') {
        Some(0) => false,
        Some(dot) => dot + 1 < domain.len(),
        None => false,
    }
}

fn password_hash(salt: &str, password: &str) -> String {
    let digest = Sha256::digest(format!("{salt}:{password}").as_bytes());
    hex::encode(digest)
}

fn random_salt() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
