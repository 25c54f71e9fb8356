//! Shared server state
//!
//! One instance owns every store, the session registry and the activity
//! log; connection workers receive it behind an `Arc`. Nothing here is
//! global — lifecycle starts in `main` and ends with the process.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result};

use crate::config::ServerConfig;
use crate::logger::ActivityLog;
use crate::sessions::{ConnId, SessionRegistry};
use crate::store::accounts::AccountStore;
use crate::store::friends::FriendStore;
use crate::store::gm::GmStore;
use crate::store::groups::GroupStore;
use crate::store::pm::PmStore;

pub struct ServerState {
    pub config: ServerConfig,
    pub accounts: AccountStore,
    pub friends: FriendStore,
    pub groups: GroupStore,
    pub pm: PmStore,
    pub gm: GmStore,
    pub sessions: SessionRegistry,
    pub activity: ActivityLog,
    next_conn_id: AtomicU64,
    connection_count: AtomicUsize,
}

impl ServerState {
    /// Open every store under the configured data directory.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let dir = &config.data_dir;
        let accounts =
            AccountStore::open(dir.join("users.db")).context("opening account store")?;
        let friends =
            FriendStore::open(dir.join("friends.db")).context("opening friendship store")?;
        let groups = GroupStore::open(dir.join("groups.db"), dir.join("group_members.db"))
            .context("opening group store")?;
        let pm = PmStore::open(dir.join("pm")).context("opening private message store")?;
        let gm = GmStore::open(dir.join("gm")).context("opening group message store")?;
        let sessions = SessionRegistry::new(std::time::Duration::from_secs(
            config.session_timeout_secs,
        ));
        let activity = ActivityLog::open(dir).context("opening activity log")?;

        Ok(Self {
            config,
            accounts,
            friends,
            groups,
            pm,
            gm,
            sessions,
            activity,
            next_conn_id: AtomicU64::new(1),
            connection_count: AtomicUsize::new(0),
        })
    }

    pub fn allocate_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_opened(&self) -> usize {
        self.connection_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> usize {
        self.connection_count.fetch_sub(1, Ordering::Relaxed) - 1
    }
}
