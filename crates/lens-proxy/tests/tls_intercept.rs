//! CONNECT interception end to end: the client trusts the generated root,
//! handshakes against a minted leaf, and the engine re-originates over TLS
//! to the real server while capturing the plaintext exchange.

use std::sync::Arc;
use std::time::Duration;

use lens_pki::{CaStore, LeafMinter, MemorySecretStore, DEFAULT_LEAF_CACHE_TTL};
use lens_proxy::{Listener, ProxyConfig, ProxyEngine};
use lens_store::{Protocol, RecordFilter, TrafficRecord, TrafficStore};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn build_engine(config: ProxyConfig) -> Arc<ProxyEngine> {
    ProxyEngine::new(
        config,
        Arc::new(MemorySecretStore::new()),
        TrafficStore::in_memory(100).expect("open store"),
    )
    .expect("build engine")
}

async fn wait_for_records(engine: &ProxyEngine, count: usize) -> Vec<TrafficRecord> {
    for _ in 0..400 {
        let records = engine
            .store()
            .list(&RecordFilter::default(), None, 100)
            .expect("list records");
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("expected {count} traffic records before the deadline");
}

/// TLS origin with its own throwaway root, serving a tiny fixed response.
async fn spawn_tls_origin() -> u16 {
    let ca = Arc::new(CaStore::new(
        "Origin Fixture",
        Arc::new(MemorySecretStore::new()),
    ));
    ca.generate().expect("generate origin CA");
    let minter = LeafMinter::new(Arc::clone(&ca), DEFAULT_LEAF_CACHE_TTL);
    let identity = minter.identity_for("localhost").expect("mint origin leaf");
    let authority = ca.active().expect("active origin CA");

    let chain = vec![
        CertificateDer::from(identity.cert_der.clone()),
        CertificateDer::from(authority.cert_der().to_vec()),
    ];
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(identity.key_pkcs8_der.clone()));
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .expect("origin server config");
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let port = listener.local_addr().expect("origin addr").port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut chunk = [0_u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    match tls.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => head.extend_from_slice(&chunk[..read]),
                    }
                }
                let _ = tls
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok")
                    .await;
                let _ = tls.flush().await;
                let _ = tls.read(&mut chunk).await;
            });
        }
    });

    port
}

/// CONNECT through the proxy, handshake trusting `root_der`, send one GET,
/// read until the server closes.
async fn https_get_via_proxy(
    proxy_addr: std::net::SocketAddr,
    host: &str,
    port: u16,
    root_der: &[u8],
) -> String {
    let mut tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    tcp.write_all(connect.as_bytes()).await.expect("send CONNECT");

    let mut established = Vec::new();
    let mut chunk = [0_u8; 256];
    while !established.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = tcp.read(&mut chunk).await.expect("read CONNECT response");
        assert_ne!(read, 0, "proxy closed before answering CONNECT");
        established.extend_from_slice(&chunk[..read]);
    }
    assert!(String::from_utf8_lossy(&established)
        .starts_with("HTTP/1.1 200 Connection Established"));

    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(root_der.to_vec()))
        .expect("trust the proxy root");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("handshake against the minted leaf");

    tls.write_all(
        format!("GET /secure HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await
    .expect("send request");

    let mut response = Vec::new();
    let mut buffer = [0_u8; 1024];
    loop {
        match tls.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => response.extend_from_slice(&buffer[..read]),
        }
    }
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intercepted_connect_captures_plaintext_and_reuses_the_leaf() {
    let origin_port = spawn_tls_origin().await;

    let engine = build_engine(ProxyConfig {
        upstream_tls_insecure: true,
        ..ProxyConfig::default()
    });
    let authority = engine.ca().generate().expect("generate proxy CA");
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let first = https_get_via_proxy(
        listener.local_addr(),
        "localhost",
        origin_port,
        authority.cert_der(),
    )
    .await;
    assert!(first.starts_with("HTTP/1.1 200 OK"), "got: {first}");
    assert!(first.ends_with("ok"));

    let second = https_get_via_proxy(
        listener.local_addr(),
        "localhost",
        origin_port,
        authority.cert_der(),
    )
    .await;
    assert!(second.ends_with("ok"));

    // Two connections to the same host within the TTL mint exactly once.
    assert_eq!(engine.minter_metrics().leaves_minted, 1);

    let records = wait_for_records(&engine, 2).await;
    for record in records.iter().take(2) {
        assert_eq!(record.protocol, Protocol::Https);
        assert_eq!(record.method, "GET");
        assert_eq!(record.host, "localhost");
        assert_eq!(record.path, "/secure");
        assert_eq!(record.status, Some(200));
        assert_eq!(record.response_body, b"ok");
        assert_eq!(record.response_content_type.as_deref(), Some("text/plain"));
        assert!(record.error.is_none());
    }

    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_connect_target_yields_502_and_a_record() {
    let engine = build_engine(ProxyConfig {
        intercept_tls: false,
        ..ProxyConfig::default()
    });
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let mut client = TcpStream::connect(listener.local_addr())
        .await
        .expect("connect proxy");
    // Port 9 is discard; nothing listens there in the test environment.
    client
        .write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\n\r\n")
        .await
        .expect("send CONNECT");

    let mut response = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        match client.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                response.extend_from_slice(&chunk[..read]);
                if response.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502 Bad Gateway"));

    let records = wait_for_records(&engine, 1).await;
    assert!(records[0]
        .error
        .as_deref()
        .expect("error recorded")
        .starts_with("upstream_unreachable"));

    listener.shutdown().await;
}
