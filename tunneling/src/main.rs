mod forward;
mod handler;
mod registry;
mod tls;

use std::net::SocketAddr;
use std::time::Duration;

use shared::{DynError, set_tcp_keepalive};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const TUNNEL_PORT: u16 = 49153;
const TCP_KEEPALIVE: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<(), DynError> {
    init_tracing();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls_config = tls::build_server_config()?;
    let acceptor = TlsAcceptor::from(tls_config);
    let state = registry::TunnelServer::new();

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], TUNNEL_PORT));
    let listener = TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, "tunnel server ready");

    loop {
        let (conn, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) if forward::is_transient_accept_error(&err) => {
                warn!(%err, "accept failed; retrying");
                sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
            Err(err) => {
                error!(%err, "tunnel listener terminated");
                return Err(err.into());
            }
        };

        set_tcp_keepalive(&conn, TCP_KEEPALIVE);
        conn.set_nodelay(true).ok();

        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(conn).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%peer_addr, %err, "TLS handshake failed");
                    return;
                }
            };
            info!(%peer_addr, "tunnel connection established");
            handler::handle_client(tls_stream, peer_addr, state).await;
        });
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Another subscriber was already set; continue with existing configuration.
    }
}
