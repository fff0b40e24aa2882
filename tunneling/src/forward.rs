//! Forward loop: one per bound remote port, bridging inbound TCP connections
//! onto streams of the active tunnel session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use shared::pipe::pipe;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::registry::{SESSION_CLOSE_TIMEOUT, TunnelServer};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn forward_loop(listener: TcpListener, port: u16, state: Arc<TunnelServer>) {
    loop {
        let (conn, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) if is_transient_accept_error(&err) => {
                warn!(port, %err, "accept failed; retrying");
                sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
            Err(err) => {
                warn!(port, %err, "forward listener terminated");
                return;
            }
        };

        let Some(session) = state.active_session().await else {
            debug!(port, %peer_addr, "no active tunnel session; dropping connection");
            continue;
        };
        if session.is_closed() {
            debug!(port, %peer_addr, "tunnel session closed; dropping connection");
            continue;
        }

        if !state.allow_stream().await {
            warn!(port, %peer_addr, "rate limit exceeded; refusing connection");
            continue;
        }

        if !state.increment_streams() {
            warn!(port, %peer_addr, "concurrent stream cap reached; refusing connection");
            continue;
        }

        let mut stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(err) => {
                state.decrement_streams();
                warn!(port, %err, "failed to open tunnel stream");
                continue;
            }
        };

        if let Err(err) = stream.write_all(format!("{port}\n").as_bytes()).await {
            state.decrement_streams();
            warn!(port, %err, "failed to send port header");
            continue;
        }

        // The peer must acknowledge within the deadline or the whole session
        // is presumed dead and torn down.
        let mut ack = [0u8; 3];
        let acknowledged = match timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut ack)).await {
            Ok(Ok(_)) => &ack[..2] == b"OK",
            Ok(Err(_)) | Err(_) => false,
        };
        if !acknowledged {
            state.decrement_streams();
            warn!(port, "stream unacknowledged; killing tunnel session");
            if timeout(SESSION_CLOSE_TIMEOUT, session.close()).await.is_err() {
                warn!(port, "killed session did not close within the deadline");
            }
            continue;
        }

        let state = state.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            let mut stream = stream;
            pipe(&mut conn, &mut stream, "conn/stream").await;
            let _ = conn.shutdown().await;
            let _ = stream.shutdown().await;
            state.decrement_streams();
        });
    }
}

pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
