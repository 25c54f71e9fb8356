//! Server configuration

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Seconds of inactivity before a session expires
    pub session_timeout_secs: u64,
    /// Directory holding every persistent store
    pub data_dir: PathBuf,
    /// Listen backlog handed to the kernel
    pub listen_backlog: u32,
}

const DEFAULT_PORT: u16 = 8888;
const DEFAULT_SESSION_TIMEOUT: u64 = 3600;

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PARLEY_PORT")
                .unwrap_or_else(|_| DEFAULT_PORT.to_string())
                .parse()
                .context("Invalid PARLEY_PORT")?,
            session_timeout_secs: parse_timeout(
                &env::var("PARLEY_SESSION_TIMEOUT")
                    .unwrap_or_else(|_| DEFAULT_SESSION_TIMEOUT.to_string()),
            )
            .context("Invalid PARLEY_SESSION_TIMEOUT")?,
            data_dir: env::var("PARLEY_DATA_DIR")
                .unwrap_or_else(|_| "data".to_string())
                .into(),
            listen_backlog: env::var("PARLEY_LISTEN_BACKLOG")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .context("Invalid PARLEY_LISTEN_BACKLOG")?,
        };

        Ok(config)
    }

    /// Apply the optional `[port] [session_timeout_seconds]` positional
    /// arguments, which take precedence over the environment.
    pub fn apply_args<I>(mut self, mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        if let Some(port) = args.next() {
            self.port = port.parse().context("Invalid port argument")?;
        }
        if let Some(timeout) = args.next() {
            self.session_timeout_secs =
                parse_timeout(&timeout).context("Invalid session timeout argument")?;
        }
        Ok(self)
    }
}

/// Timeouts are given as signed seconds; zero or negative means "use the
/// default", so deployment scripts can pass 0 as a placeholder.
fn parse_timeout(s: &str) -> Result<u64> {
    let raw: i64 = s.parse()?;
    Ok(if raw <= 0 {
        DEFAULT_SESSION_TIMEOUT
    } else {
        raw as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT,
            data_dir: "data".into(),
            listen_backlog: 64,
        }
    }

    #[test]
    fn test_positional_args_override() {
        let config = base()
            .apply_args(["9001".to_string(), "120".to_string()].into_iter())
            .unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.session_timeout_secs, 120);
    }

    #[test]
    fn test_no_args_keep_defaults() {
        let config = base().apply_args(std::iter::empty()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.session_timeout_secs, DEFAULT_SESSION_TIMEOUT);
    }

    #[test]
    fn test_nonpositive_timeout_falls_back() {
        let config = base()
            .apply_args(["8888".to_string(), "0".to_string()].into_iter())
            .unwrap();
        assert_eq!(config.session_timeout_secs, DEFAULT_SESSION_TIMEOUT);
        let config = base()
            .apply_args(["8888".to_string(), "-5".to_string()].into_iter())
            .unwrap();
        assert_eq!(config.session_timeout_secs, DEFAULT_SESSION_TIMEOUT);
    }

    #[test]
    fn test_bad_port_argument() {
        assert!(base().apply_args(["nope".to_string()].into_iter()).is_err());
    }
}
