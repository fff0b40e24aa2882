use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use shared::DynError;

const CA_PATH: &str = "certs/ca.pem";
const CERT_PATH: &str = "certs/server-cert.pem";
const KEY_PATH: &str = "certs/server-key.pem";

/// Build the mutual-TLS server configuration: present the server certificate
/// and require a client certificate signed by the shared CA.
pub(crate) fn build_server_config() -> Result<Arc<ServerConfig>, DynError> {
    let roots = shared::tls::load_ca_roots(CA_PATH)?;
    let certs = shared::tls::load_cert_chain(CERT_PATH)?;
    let key = shared::tls::load_private_key(KEY_PATH)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| format!("failed to build client certificate verifier: {err}"))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|err| format!("failed to build TLS server config: {err}"))?;

    Ok(Arc::new(config))
}
