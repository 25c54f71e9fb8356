//! Shared harness for wire-level tests: boots the real accept loop on an
//! ephemeral port with a throwaway data directory, and drives it through
//! the same framing layer a production client would use.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_server::config::ServerConfig;
use parley_server::connection;
use parley_server::state::ServerState;
use parley_shared::{kv_get, LineFramer};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub port: u16,
    // holds the data directory alive for the duration of the test
    data_dir: TempDir,
}

impl TestServer {
    /// Hand the data directory to a successor server, modeling a restart.
    pub fn into_data_dir(self) -> TempDir {
        self.data_dir
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(TempDir::new().expect("temp dir"), 3600).await
}

/// Start a server over an existing data directory, e.g. to model a restart.
pub async fn start_server_with(data_dir: TempDir, session_timeout_secs: u64) -> TestServer {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        session_timeout_secs,
        data_dir: data_dir.path().to_path_buf(),
        listen_backlog: 64,
    };
    let state = Arc::new(ServerState::new(config).expect("server state"));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            tokio::spawn(connection::serve_connection(state.clone(), stream, peer));
        }
    });

    TestServer { port, data_dir }
}

/// One client connection speaking the line protocol.
pub struct Conn {
    stream: TcpStream,
    framer: LineFramer,
}

impl Conn {
    pub async fn connect(server: &TestServer) -> Conn {
        let stream = TcpStream::connect(("127.0.0.1", server.port))
            .await
            .expect("connect");
        Conn {
            stream,
            framer: LineFramer::new(),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("send");
    }

    /// Write raw bytes without framing, for malformed-input tests.
    pub async fn raw_write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("raw write");
    }

    /// Receive the next frame, panicking after a timeout.
    pub async fn recv_line(&mut self) -> String {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_line_inner())
            .await
            .expect("timed out waiting for a line")
            .expect("connection closed while waiting for a line")
    }

    /// Receive the next frame, or `None` once the server closes the stream.
    pub async fn try_recv_line(&mut self) -> Option<String> {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_line_inner())
            .await
            .expect("timed out waiting for close or line")
    }

    /// `None` means the stream closed.
    async fn recv_line_inner(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.framer.pop_line().expect("framing") {
                return Some(line);
            }
            let mut buf = [0u8; 1024];
            match self.stream.read(&mut buf).await {
                Ok(0) => return None,
                Ok(n) => self.framer.push_bytes(&buf[..n]),
                Err(_) => return None,
            }
        }
    }

    /// Send a request and return its (kind, req_id, payload) response,
    /// skipping any push frames that arrive first.
    pub async fn roundtrip(&mut self, line: &str) -> (String, String, String) {
        self.send_line(line).await;
        loop {
            let reply = self.recv_line().await;
            if reply.starts_with("PUSH ") {
                continue;
            }
            return split_reply(&reply);
        }
    }

    /// Assert that nothing arrives on this connection for `dur`.
    pub async fn expect_silence(&mut self, dur: Duration) {
        match tokio::time::timeout(dur, self.recv_line_inner()).await {
            Err(_) => {}
            Ok(Some(line)) => panic!("unexpected frame: {line}"),
            Ok(None) => panic!("connection closed unexpectedly"),
        }
    }

    /// Wait for a push frame with the given subject, skipping other frames.
    pub async fn expect_push(&mut self, subject: &str) -> String {
        let want = format!("PUSH {subject} ");
        loop {
            let line = self.recv_line().await;
            if let Some(payload) = line.strip_prefix(&want) {
                return payload.to_string();
            }
        }
    }
}

/// Split `OK <rid> <payload>` / `ERR <rid> <rest>` into its three parts.
pub fn split_reply(line: &str) -> (String, String, String) {
    let mut parts = line.splitn(3, ' ');
    let kind = parts.next().unwrap_or_default().to_string();
    let rid = parts.next().unwrap_or_default().to_string();
    let rest = parts.next().unwrap_or_default().to_string();
    (kind, rid, rest)
}

/// Register + login a user, returning the session token.
pub async fn login_user(conn: &mut Conn, username: &str, password: &str) -> String {
    let (kind, _, _) = conn
        .roundtrip(&format!(
            "REGISTER 1 username={username} password={password} email={username}@test.io"
        ))
        .await;
    // re-registration across tests sharing a server is fine
    assert!(kind == "OK" || kind == "ERR");

    let (kind, _, rest) = conn
        .roundtrip(&format!("LOGIN 2 username={username} password={password}"))
        .await;
    assert_eq!(kind, "OK", "login failed: {rest}");
    kv_get(&rest, "token").expect("token in login reply").to_string()
}
