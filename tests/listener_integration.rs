//! TLS listener integration tests over TCP

mod common;

use common::pki;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use vtls::{ListenerConfig, ListenerEvent, ServerContext, TlsConfig, TlsError, TlsListener, TlsVersion};

#[test]
fn test_spawned_tcp_listener() {
    let settings = ListenerConfig { max_concurrent_handshakes: 2, ..ListenerConfig::default() };
    let listener =
        TlsListener::bind_with("127.0.0.1:0", TlsConfig::server().build().unwrap(), settings).unwrap();
    let addr = listener.local_addr().unwrap();

    let example = pki(&["www.example.com"]);
    listener
        .add_context("www.example.com", ServerContext::new(example.identity.clone()))
        .unwrap();

    let (handle, events) = listener.spawn().unwrap();

    let clients: Vec<_> = (0..4)
        .map(|i| {
            let anchors = example.anchors();
            thread::spawn(move || {
                let mut stream = TlsConfig::client()
                    .servername("www.example.com")
                    .trust_anchors(anchors)
                    .build()
                    .unwrap()
                    .connect(TcpStream::connect(addr).unwrap())
                    .unwrap();
                assert!(stream.authorized());
                stream.write(&[i as u8]).unwrap();
                stream.close().unwrap();
            })
        })
        .collect();

    let mut seen = Vec::new();
    for _ in 0..4 {
        match events.recv_timeout(Duration::from_secs(10)).unwrap() {
            ListenerEvent::Established(mut stream) => {
                assert_eq!(stream.servername(), Some("www.example.com"));
                let mut buf = [0u8; 1];
                assert_eq!(stream.read(&mut buf).unwrap(), 1);
                seen.push(buf[0]);
            }
            ListenerEvent::Failed { error, .. } => panic!("handshake failed: {}", error),
        }
    }
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3]);

    for c in clients {
        c.join().unwrap();
    }
    handle.shutdown();
}

#[test]
fn test_failed_handshake_reported() {
    let server_config = TlsConfig::server().version(TlsVersion::Tls13).build().unwrap();
    let listener = TlsListener::bind("127.0.0.1:0", server_config).unwrap();
    let addr = listener.local_addr().unwrap();
    let (handle, events) = listener.spawn().unwrap();

    let result = TlsConfig::client()
        .version(TlsVersion::Tls12)
        .verify_peer(false)
        .build()
        .unwrap()
        .connect(TcpStream::connect(addr).unwrap());
    assert!(result.is_err());

    match events.recv_timeout(Duration::from_secs(10)).unwrap() {
        ListenerEvent::Failed { error, stream } => {
            assert!(matches!(error, TlsError::Negotiation(_)));
            assert!(stream.info().failed);
        }
        ListenerEvent::Established(_) => panic!("handshake should have failed"),
    }
    handle.shutdown();
}

#[test]
fn test_shutdown_stops_accepting() {
    let listener = TlsListener::bind("127.0.0.1:0", TlsConfig::server().build().unwrap()).unwrap();
    let (handle, events) = listener.spawn().unwrap();
    assert_eq!(handle.active_handshakes(), 0);

    handle.shutdown();
    // The accept loop dropped its sender
    assert!(events.recv_timeout(Duration::from_secs(1)).is_err());
}
