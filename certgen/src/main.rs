//! Offline generator for the mutual-TLS material: a CA, a server certificate
//! with the public address in its SANs, and a client certificate. Writes the
//! on-disk layout both processes expect under `certs/`.

use std::env;
use std::fs;
use std::net::IpAddr;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use shared::DynError;

fn main() -> Result<(), DynError> {
    let server_addr = env::var("SERVER_ADDR").unwrap_or_default();
    let server_addr = server_addr.trim().to_string();
    if server_addr.is_empty() {
        return Err("usage: SERVER_ADDR=<ip-or-domain> certgen".into());
    }

    let mut ip_addresses: Vec<IpAddr> = vec![IpAddr::from([127, 0, 0, 1])];
    let mut dns_names: Vec<String> = Vec::new();

    if let Ok(ip) = server_addr.parse::<IpAddr>() {
        println!("generating certificates for IP {ip}");
        ip_addresses.push(ip);
    } else if is_valid_domain(&server_addr) {
        println!("generating certificates for domain {server_addr}");
        dns_names.push(server_addr.clone());
    } else {
        return Err(format!("invalid domain or IP: {server_addr}").into());
    }

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Tunnel CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let server_key = KeyPair::generate()?;
    let server_cert = server_params(&ip_addresses, &dns_names)?
        .signed_by(&server_key, &ca_cert, &ca_key)?;

    let client_key = KeyPair::generate()?;
    let client_cert = client_params().signed_by(&client_key, &ca_cert, &ca_key)?;

    write_certs(
        &ca_cert,
        &server_cert,
        &server_key,
        &client_cert,
        &client_key,
    )?;
    println!("certificates created in 'certs/'");
    Ok(())
}

fn server_params(
    ip_addresses: &[IpAddr],
    dns_names: &[String],
) -> Result<CertificateParams, DynError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "Tunnel Server");
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    for ip in ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }
    for name in dns_names {
        params
            .subject_alt_names
            .push(SanType::DnsName(name.clone().try_into()?));
    }
    Ok(params)
}

fn client_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "Tunnel Client");
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params
}

fn write_certs(
    ca_cert: &Certificate,
    server_cert: &Certificate,
    server_key: &KeyPair,
    client_cert: &Certificate,
    client_key: &KeyPair,
) -> Result<(), DynError> {
    fs::create_dir_all("certs")?;
    fs::write("certs/ca.pem", ca_cert.pem())?;
    fs::write("certs/server-cert.pem", server_cert.pem())?;
    fs::write("certs/server-key.pem", server_key.serialize_pem())?;
    fs::write("certs/client-cert.pem", client_cert.pem())?;
    fs::write("certs/client-key.pem", client_key.serialize_pem())?;
    Ok(())
}

fn is_valid_domain(domain: &str) -> bool {
    if domain == "localhost" {
        return true;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_and_ips_are_classified() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("tunnel.internal.example.org"));
        assert!(is_valid_domain("localhost"));
        assert!(!is_valid_domain("no-dots"));
        assert!(!is_valid_domain("bad-.example.com"));
        assert!(!is_valid_domain("under_score.example.com"));
        assert!(!is_valid_domain(""));
    }
}
