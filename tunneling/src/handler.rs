//! Per-client session handler: decode the handshake, take over as the active
//! session, make sure the declared forward listeners exist, then wait for the
//! session to end.

use std::net::SocketAddr;
use std::sync::Arc;

use shared::mux::MuxSession;
use shared::{DynError, Handshake, validate_port};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::forward::forward_loop;
use crate::registry::TunnelServer;

pub(crate) async fn handle_client<T>(io: T, peer_addr: SocketAddr, state: Arc<TunnelServer>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session = Arc::new(MuxSession::server(io));

    let handshake = match read_handshake(&session).await {
        Ok(handshake) => handshake,
        Err(err) => {
            warn!(%peer_addr, %err, "failed to read handshake");
            session.close().await;
            return;
        }
    };

    if handshake.mappings.is_empty() {
        warn!(%peer_addr, "handshake carried no mappings");
        session.close().await;
        return;
    }

    state.set_active_session(session.clone()).await;
    info!(
        %peer_addr,
        mappings = handshake.mappings.len(),
        "tunnel session active"
    );

    for mapping in &handshake.mappings {
        let port = mapping.remote_port;
        if !validate_port(port) || state.has_listener(port).await {
            continue;
        }

        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                // The mapping is simply not served; the session stays up.
                warn!(port, %err, "failed to bind forward listener");
                continue;
            }
        };
        let bound_addr = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)));

        state.add_listener(port, bound_addr).await;
        info!(port, "forwarding port");

        let state = state.clone();
        tokio::spawn(async move {
            forward_loop(listener, port, state).await;
        });
    }

    session.closed().await;
    info!(%peer_addr, "tunnel client disconnected");
    state.clear_active_session(&session).await;
}

async fn read_handshake(session: &MuxSession) -> Result<Handshake, DynError> {
    let Some(mut stream) = session.accept_stream().await else {
        return Err("session closed before handshake".into());
    };

    // The client half-closes after writing, so the record is delimited by
    // end-of-stream.
    let mut payload = Vec::new();
    stream.read_to_end(&mut payload).await?;
    let handshake: Handshake = serde_json::from_slice(&payload)?;
    let _ = stream.shutdown().await;
    Ok(handshake)
}
