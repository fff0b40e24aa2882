//! PEM loading helpers for the mutual-TLS material both processes use.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::DynError;

/// Load a CA bundle and build the trust store both peers verify against.
pub fn load_ca_roots(path: impl AsRef<Path>) -> Result<RootCertStore, DynError> {
    let path = path.as_ref();
    let mut roots = RootCertStore::empty();
    for cert in read_pem_certs(path)? {
        roots
            .add(cert)
            .map_err(|err| format!("invalid CA certificate in {}: {err}", path.display()))?;
    }
    Ok(roots)
}

/// Load a certificate chain from a PEM file.
pub fn load_cert_chain(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, DynError> {
    read_pem_certs(path.as_ref())
}

/// Load the first private key found in a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, DynError> {
    let path = path.as_ref();
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))?
        .ok_or_else(|| format!("no private key found in {}", path.display()).into())
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, DynError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))?;
    if certs.is_empty() {
        return Err(format!("no certificates found in {}", path.display()).into());
    }
    Ok(certs)
}

fn open(path: &Path) -> Result<BufReader<File>, DynError> {
    let file =
        File::open(path).map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    Ok(BufReader::new(file))
}
