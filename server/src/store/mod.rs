//! File-backed persistent stores
//!
//! Every store is a plain-text file (or directory of files) under the data
//! directory, one record per line with `|`-separated fields. Mutations either
//! append a line or rewrite the whole file to a `.tmp` sibling and rename it
//! into place, so readers never observe a torn record. Each store serializes
//! all access through its own mutex; stores never call each other while
//! holding their lock.

pub mod accounts;
pub mod friends;
pub mod gm;
pub mod groups;
pub mod pm;

use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix seconds.
pub fn unix_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Read a record file into lines, treating a missing file as empty.
pub(crate) fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_owned).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Rewrite a record file atomically: write a `.tmp` sibling, then rename it
/// over the original.
pub(crate) fn write_replace(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Append a single record line to a file.
///
/// If a crash left the file without a trailing newline, the new record is
/// started on a fresh line instead of gluing onto the torn one.
pub(crate) fn append_line(path: &Path, line: &str) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut f = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    let len = f.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        f.seek(SeekFrom::End(-1))?;
        f.read_exact(&mut last)?;
        if last[0] != b'\n' {
            f.write_all(b"\n")?;
        }
    }
    writeln!(f, "{line}")
}
