use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use shared::mux::MuxSession;
use shared::{DynError, Handshake, set_tcp_keepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::stream::handle_stream;

const RETRY_DELAY: Duration = Duration::from_millis(200);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(10);

/// Maintains the single outbound tunnel connection, reconnecting forever.
pub(crate) struct Tunnel {
    addr: String,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake: Handshake,
    port_map: Arc<HashMap<u16, String>>,
}

impl Tunnel {
    pub(crate) fn new(
        addr: String,
        connector: TlsConnector,
        server_name: ServerName<'static>,
        handshake: Handshake,
        port_map: Arc<HashMap<u16, String>>,
    ) -> Self {
        Self {
            addr,
            connector,
            server_name,
            handshake,
            port_map,
        }
    }

    /// Connect, serve one session to completion, back off briefly, repeat.
    pub(crate) async fn run(&self) {
        loop {
            info!(addr = %self.addr, "connecting to tunnel server");
            if let Err(err) = self.one_session().await {
                warn!(%err, "tunnel session failed");
            }
            info!("disconnected; retrying shortly");
            sleep(RETRY_DELAY).await;
        }
    }

    async fn one_session(&self) -> Result<(), DynError> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| format!("timed out dialing {}", self.addr))?
            .map_err(|err| format!("failed to dial {}: {err}", self.addr))?;
        set_tcp_keepalive(&stream, TCP_KEEPALIVE);
        stream.set_nodelay(true).ok();

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|err| format!("TLS handshake failed: {err}"))?;
        info!("tunnel established");

        let session = MuxSession::client(tls_stream);
        if let Err(err) = self.send_handshake(&session).await {
            session.close().await;
            return Err(err);
        }

        while let Some(stream) = session.accept_stream().await {
            let port_map = self.port_map.clone();
            tokio::spawn(async move {
                handle_stream(stream, port_map).await;
            });
        }

        session.close().await;
        Ok(())
    }

    async fn send_handshake(&self, session: &MuxSession) -> Result<(), DynError> {
        let mut stream = session.open_stream().await?;
        let payload = serde_json::to_vec(&self.handshake)?;
        stream.write_all(&payload).await?;
        // Half-close signals end of the handshake record to the server.
        stream.shutdown().await?;
        Ok(())
    }
}
