//! Append-only activity log
//!
//! Significant account and messaging events land in `server.log` under the
//! data directory, one `[YYYY-MM-DD HH:MM:SS] event` line each. This is the
//! operator-facing audit trail; runtime diagnostics go through `tracing`
//! instead. Logging failures are swallowed — the log must never take a
//! request down with it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

pub struct ActivityLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ActivityLog {
    pub fn open(data_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join("server.log"),
            lock: Mutex::new(()),
        })
    }

    /// Append one event line, best-effort.
    pub fn event(&self, message: &str) {
        let _guard = self.lock.lock().unwrap();
        let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) else {
            return;
        };
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(f, "[{ts}] {message}");
    }
}
