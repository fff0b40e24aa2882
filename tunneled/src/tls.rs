use std::sync::Arc;

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use shared::DynError;

const CA_PATH: &str = "certs/ca.pem";
const CERT_PATH: &str = "certs/client-cert.pem";
const KEY_PATH: &str = "certs/client-key.pem";

/// Build the mutual-TLS client configuration: present the client certificate
/// and verify the server against the shared CA, with SNI set to the
/// configured server address.
pub(crate) fn build_client_config(
    server_addr: &str,
) -> Result<(Arc<ClientConfig>, ServerName<'static>), DynError> {
    let roots = shared::tls::load_ca_roots(CA_PATH)?;
    let certs = shared::tls::load_cert_chain(CERT_PATH)?;
    let key = shared::tls::load_private_key(KEY_PATH)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|err| format!("failed to build TLS client config: {err}"))?;

    let server_name = ServerName::try_from(server_addr.to_string())
        .map_err(|err| format!("invalid server name '{server_addr}': {err}"))?;

    Ok((Arc::new(config), server_name))
}
