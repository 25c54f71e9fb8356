//! Per-connection worker
//!
//! One worker per accepted TCP connection. The socket splits into a read
//! half driven by the line framer and a writer task fed through an mpsc
//! channel. Every outbound frame — responses from this worker and pushes
//! originated by other workers — goes through that channel, so frames never
//! interleave mid-line on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use parley_shared::{fmt_err, FrameError, LineFramer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handlers::{self, Flow};
use crate::state::ServerState;

/// Outbound frames queued per connection before senders start blocking.
const OUTBOUND_BUFFER: usize = 64;

const READ_CHUNK: usize = 2048;

pub async fn serve_connection(state: Arc<ServerState>, stream: TcpStream, addr: SocketAddr) {
    let conn_id = state.allocate_conn_id();
    let open = state.connection_opened();
    info!("connection {} from {} open ({} active)", conn_id, addr, open);

    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut framer = LineFramer::new();
    let mut buf = [0u8; READ_CHUNK];

    'conn: loop {
        // drain every complete line before touching the socket again
        loop {
            match framer.pop_line() {
                Ok(Some(line)) => {
                    match handlers::handle_line(&state, conn_id, &tx, &line).await {
                        Flow::Continue => {}
                        Flow::Disconnect => break 'conn,
                    }
                }
                Ok(None) => break,
                Err(FrameError::LineTooLong { max }) => {
                    warn!("connection {}: line over {} bytes, dropping", conn_id, max);
                    break 'conn;
                }
                Err(FrameError::Encoding) => {
                    // the broken line is already consumed; answer and move on
                    if tx.send(fmt_err("0", 400, "bad_request")).await.is_err() {
                        break 'conn;
                    }
                }
            }
        }

        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => framer.push_bytes(&buf[..n]),
            Err(e) => {
                debug!("connection {}: read error: {}", conn_id, e);
                break;
            }
        }
    }

    if let Some(session) = state.sessions.remove_by_connection(conn_id) {
        state.activity.event(&format!(
            "user_id={} session dropped with connection",
            session.user_id
        ));
        debug!(
            "connection {}: session for user {} evicted after {:?}",
            conn_id,
            session.user_id,
            session.created_at.elapsed()
        );
    }

    drop(tx);
    let _ = writer.await;
    let left = state.connection_closed();
    info!("connection {} from {} closed ({} active)", conn_id, addr, left);
}
