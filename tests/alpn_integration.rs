//! ALPN negotiation integration tests
//!
//! These tests verify ALPN configuration and that protocol selection follows
//! the server's preference order across a real handshake.

mod common;

use common::serve;
use vtls::{AlertDescription, TlsConfig, TlsError, TlsVersion};

fn negotiate(client: &[&str], server: &[&str]) -> (Result<Option<String>, TlsError>, Result<Option<String>, TlsError>) {
    let server_config = TlsConfig::server().alpn(server).unwrap().build().unwrap();
    let (transport, handle) = serve(server_config, |s| s.map(|s| s.alpn_protocol().map(String::from)));

    let client_result = TlsConfig::client()
        .verify_peer(false)
        .alpn(client)
        .unwrap()
        .build()
        .unwrap()
        .connect(transport)
        .map(|c| c.alpn_protocol().map(String::from));

    (client_result, handle.join().unwrap())
}

#[test]
fn test_alpn_client_config() {
    let result = TlsConfig::client().alpn(&["h2", "http/1.1"]);
    assert!(result.is_ok(), "ALPN client configuration should succeed");
}

#[test]
fn test_alpn_server_config() {
    let result = TlsConfig::server().alpn(&["h2", "http/1.1"]);
    assert!(result.is_ok(), "ALPN server configuration should succeed");
}

#[test]
fn test_alpn_with_tls_versions() {
    let result = TlsConfig::client().version(TlsVersion::Tls12).alpn(&["h2"]);
    assert!(result.is_ok(), "ALPN with TLS 1.2 should succeed");

    let result = TlsConfig::client().version(TlsVersion::Tls13).alpn(&["h2"]);
    assert!(result.is_ok(), "ALPN with TLS 1.3 should succeed");
}

#[test]
fn test_alpn_empty_list() {
    // An empty list simply disables ALPN
    let config = TlsConfig::client().alpn(&[]).unwrap().build().unwrap();
    assert!(config.options().alpn_protocols().is_empty());
}

#[test]
fn test_alpn_invalid_names() {
    assert!(TlsConfig::client().alpn(&[""]).is_err(), "Empty protocol name must be rejected");
    let long = "x".repeat(256);
    assert!(TlsConfig::server().alpn(&[long.as_str()]).is_err(), "Over-long protocol name must be rejected");
}

#[test]
fn test_server_preference_wins() {
    let (client, server) = negotiate(&["http/1.1", "h2"], &["h2", "http/1.1"]);
    assert_eq!(client.unwrap().as_deref(), Some("h2"));
    assert_eq!(server.unwrap().as_deref(), Some("h2"));
}

#[test]
fn test_single_common_protocol() {
    let (client, server) = negotiate(&["h2", "http/1.1"], &["http/1.1"]);
    assert_eq!(client.unwrap().as_deref(), Some("http/1.1"));
    assert_eq!(server.unwrap().as_deref(), Some("http/1.1"));
}

#[test]
fn test_no_alpn_on_one_side() {
    let (client, server) = negotiate(&["h2"], &[]);
    assert_eq!(client.unwrap(), None);
    assert_eq!(server.unwrap(), None);

    let (client, server) = negotiate(&[], &["h2"]);
    assert_eq!(client.unwrap(), None);
    assert_eq!(server.unwrap(), None);
}

#[test]
fn test_disjoint_protocols_fail() {
    let (client, server) = negotiate(&["h2"], &["http/1.1"]);
    assert!(matches!(
        client,
        Err(TlsError::AlertReceived(AlertDescription::NoApplicationProtocol))
    ));
    assert!(matches!(server, Err(TlsError::Negotiation(_))));
}
