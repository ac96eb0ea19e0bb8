//! Configuration files feeding a host network

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::net::UnixDatagram;

use nsnet::config::{create_default_config, load_config, load_config_with_env};
use nsnet::{ConfigError, HostNetwork, NsNetError};

#[tokio::test]
async fn test_config_file_drives_host_network() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "options": {{
                "udp": {{ "threads": 2, "queue_size": 64, "stats": true }},
                "tcp": {{ "max_conns": 8 }},
                "network": {{ "mtu": 1400, "ipv6_address": null }}
            }},
            "log": {{ "level": "debug" }}
        }}"#
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.options.udp.threads, 2);
    assert_eq!(config.options.network.mtu, 1400);
    assert!(config.options.network.ipv6_address.is_none());
    assert_eq!(config.log.level, "debug");

    let (host_end, _peer_end) = UnixDatagram::pair().unwrap();
    let host = HostNetwork::with_transport(config.options, Arc::new(host_end)).unwrap();
    assert!(host.udp_stats().is_some());
    assert!(host.tcp_stats().is_none());
    host.close().unwrap();
}

#[tokio::test]
async fn test_generated_config_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nsnet.json");

    create_default_config(&path).unwrap();
    let config = load_config_with_env(Some(&path)).unwrap();

    let (host_end, _peer_end) = UnixDatagram::pair().unwrap();
    let host = HostNetwork::with_transport(config.options, Arc::new(host_end)).unwrap();
    host.close().unwrap();
}

#[test]
fn test_invalid_config_file_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "options": {{ "network": {{ "mtu": 100 }} }} }}"#).unwrap();

    let err = load_config(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_invalid_options_surface_as_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "options": {{ "udp": {{ "threads": 3 }} }} }}"#).unwrap();
    let mut config = load_config(file.path()).unwrap();
    config.options.udp.queue_size = 0;

    let (host_end, _peer_end) = UnixDatagram::pair().unwrap();
    let result = HostNetwork::with_transport(config.options, Arc::new(host_end));
    assert!(matches!(result, Err(NsNetError::Config(_))));
}
