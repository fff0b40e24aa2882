use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use shared::{DynError, Mapping, validate_local_addr, validate_port};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    pub(crate) server_addr: String,
    pub(crate) tunnel_port: u16,
    pub(crate) mappings: Vec<Mapping>,
}

pub(crate) fn load_config(path: impl AsRef<Path>) -> Result<Config, DynError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    let config: Config = serde_json::from_slice(&bytes)
        .map_err(|err| format!("failed to decode {}: {err}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), DynError> {
    if config.server_addr.is_empty() {
        return Err("server_addr cannot be empty".into());
    }
    if !validate_port(config.tunnel_port) {
        return Err("tunnel_port must be between 1 and 65535".into());
    }
    if config.mappings.is_empty() {
        return Err("mappings cannot be empty".into());
    }
    for (index, mapping) in config.mappings.iter().enumerate() {
        if !validate_port(mapping.remote_port) {
            return Err(format!("mapping[{index}]: invalid remote_port 0").into());
        }
        if mapping.local_addr.is_empty() {
            return Err(format!("mapping[{index}]: local_addr cannot be empty").into());
        }
        validate_local_addr(&mapping.local_addr).map_err(|err| {
            format!(
                "mapping[{index}]: invalid local_addr '{}': {err}",
                mapping.local_addr
            )
        })?;
    }
    Ok(())
}

/// Remote-port lookup table, built once at startup. Duplicate remote ports
/// keep the last declaration.
pub(crate) fn build_port_map(mappings: &[Mapping]) -> HashMap<u16, String> {
    let mut port_map = HashMap::with_capacity(mappings.len());
    for mapping in mappings {
        port_map.insert(mapping.remote_port, mapping.local_addr.clone());
    }
    port_map
}

pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Another subscriber was already set; continue with existing configuration.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Config, DynError> {
        let config: Config = serde_json::from_str(json)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn valid_config_parses() {
        let config = parse(
            r#"{
                "server_addr": "tunnel.example.com",
                "tunnel_port": 49153,
                "mappings": [
                    {"remote_port": 8080, "local_addr": "127.0.0.1:80"},
                    {"remote_port": 2222, "local_addr": "localhost:22"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.server_addr, "tunnel.example.com");
        assert_eq!(config.tunnel_port, 49153);
        assert_eq!(config.mappings.len(), 2);
    }

    #[test]
    fn empty_server_addr_is_rejected() {
        let result = parse(
            r#"{"server_addr": "", "tunnel_port": 49153,
                "mappings": [{"remote_port": 8080, "local_addr": "127.0.0.1:80"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_mappings_are_rejected() {
        let result = parse(
            r#"{"server_addr": "example.com", "tunnel_port": 49153, "mappings": []}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_remote_port_is_rejected() {
        let result = parse(
            r#"{"server_addr": "example.com", "tunnel_port": 49153,
                "mappings": [{"remote_port": 0, "local_addr": "127.0.0.1:80"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_remote_port_is_rejected() {
        let result = parse(
            r#"{"server_addr": "example.com", "tunnel_port": 49153,
                "mappings": [{"remote_port": 65536, "local_addr": "127.0.0.1:80"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn malformed_local_addr_is_rejected() {
        let result = parse(
            r#"{"server_addr": "example.com", "tunnel_port": 49153,
                "mappings": [{"remote_port": 8080, "local_addr": "no-port-here"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_remote_ports_keep_last_declaration() {
        let mappings = vec![
            Mapping {
                remote_port: 8080,
                local_addr: "127.0.0.1:80".to_string(),
            },
            Mapping {
                remote_port: 8080,
                local_addr: "127.0.0.1:81".to_string(),
            },
        ];
        let port_map = build_port_map(&mappings);
        assert_eq!(port_map.len(), 1);
        assert_eq!(port_map[&8080], "127.0.0.1:81");
    }
}
