mod config;
mod stream;
mod tls;
mod tunnel;

use std::sync::Arc;

use shared::{DynError, Handshake};
use tokio_rustls::TlsConnector;
use tracing::info;

const CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> Result<(), DynError> {
    config::init_tracing();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config(CONFIG_PATH)?;
    let port_map = Arc::new(config::build_port_map(&config.mappings));
    let (tls_config, server_name) = tls::build_client_config(&config.server_addr)?;

    info!(
        server = %config.server_addr,
        port = config.tunnel_port,
        mappings = config.mappings.len(),
        "tunneled starting"
    );

    let addr = format!("{}:{}", config.server_addr, config.tunnel_port);
    let handshake = Handshake {
        mappings: config.mappings,
    };
    let tunnel = tunnel::Tunnel::new(
        addr,
        TlsConnector::from(tls_config),
        server_name,
        handshake,
        port_map,
    );
    tunnel.run().await;

    Ok(())
}
