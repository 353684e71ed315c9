//! End-to-end flows over real sockets: plain HTTP forwarding, opaque
//! CONNECT tunnels, upstream proxy CONNECT handling, and the WebSocket
//! upgrade path.

use std::sync::Arc;
use std::time::Duration;

use lens_http::{accept_key, build_frame, Opcode};
use lens_pki::MemorySecretStore;
use lens_proxy::{Listener, ProxyConfig, ProxyEngine, UpstreamProxy};
use lens_store::{Protocol, RecordFilter, TrafficRecord, TrafficStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn build_engine(config: ProxyConfig) -> Arc<ProxyEngine> {
    ProxyEngine::new(
        config,
        Arc::new(MemorySecretStore::new()),
        TrafficStore::in_memory(100).expect("open store"),
    )
    .expect("build engine")
}

async fn wait_for_records(engine: &ProxyEngine, count: usize) -> Vec<TrafficRecord> {
    for _ in 0..200 {
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

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.expect("read head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..read]);
    }
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_http_forward_captures_the_exchange() {
    let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_port = origin.local_addr().expect("origin addr").port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.expect("accept");
        let head = read_head(&mut stream).await;
        let text = String::from_utf8_lossy(&head).to_string();
        assert!(text.starts_with("GET /foo HTTP/1.1\r\n"), "got: {text}");
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nbar")
            .await
            .expect("write response");
        // Hold the socket open so keep-alive is the client's choice.
        let mut bin = [0_u8; 64];
        let _ = stream.read(&mut bin).await;
    });

    let engine = build_engine(ProxyConfig::default());
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let mut client = TcpStream::connect(listener.local_addr())
        .await
        .expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{origin_port}/foo HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let mut response = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !response.ends_with(b"bar") {
        let read = client.read(&mut chunk).await.expect("read response");
        if read == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..read]);
    }
    let response_text = String::from_utf8_lossy(&response).to_string();
    assert!(response_text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response_text.ends_with("bar"));

    let records = wait_for_records(&engine, 1).await;
    let record = &records[0];
    assert_eq!(record.method, "GET");
    assert_eq!(record.host, "127.0.0.1");
    assert_eq!(record.port, origin_port);
    assert_eq!(record.path, "/foo");
    assert_eq!(record.status, Some(200));
    assert_eq!(record.protocol, Protocol::Http);
    assert_eq!(record.response_body, b"bar");
    assert!(record.duration >= 0.0);
    assert!(record.error.is_none());

    drop(client);
    origin_task.await.expect("origin join");
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_without_interception_relays_opaque_bytes() {
    let target = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
    let target_port = target.local_addr().expect("target addr").port();
    let target_task = tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.expect("accept");
        let mut buf = [0_u8; 4];
        stream.read_exact(&mut buf).await.expect("read ping");
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.expect("write pong");
    });

    let engine = build_engine(ProxyConfig {
        intercept_tls: false,
        ..ProxyConfig::default()
    });
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let mut client = TcpStream::connect(listener.local_addr())
        .await
        .expect("connect proxy");
    let connect = format!("CONNECT 127.0.0.1:{target_port} HTTP/1.1\r\n\r\n");
    client.write_all(connect.as_bytes()).await.expect("send CONNECT");

    let established = read_head(&mut client).await;
    assert!(String::from_utf8_lossy(&established)
        .starts_with("HTTP/1.1 200 Connection Established"));

    client.write_all(b"ping").await.expect("send ping");
    let mut pong = [0_u8; 4];
    client.read_exact(&mut pong).await.expect("read pong");
    assert_eq!(&pong, b"pong");
    drop(client);

    let records = wait_for_records(&engine, 1).await;
    let record = &records[0];
    assert_eq!(record.method, "CONNECT");
    assert_eq!(record.protocol, Protocol::Https);
    assert_eq!(record.status, None);
    assert_eq!(record.host, "127.0.0.1");
    assert_eq!(record.port, target_port);

    target_task.await.expect("target join");
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_goes_through_a_configured_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_port = upstream.local_addr().expect("upstream addr").port();
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.expect("accept");
        let head = read_head(&mut stream).await;
        let text = String::from_utf8_lossy(&head).to_string();
        assert!(
            text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"),
            "got: {text}"
        );
        stream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
            .await
            .expect("answer CONNECT");
        // Play the tunnel endpoint ourselves.
        let mut buf = [0_u8; 4];
        stream.read_exact(&mut buf).await.expect("read ping");
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.expect("write pong");
    });

    let engine = build_engine(ProxyConfig {
        intercept_tls: false,
        upstream_proxy: Some(UpstreamProxy {
            host: "127.0.0.1".to_string(),
            port: upstream_port,
        }),
        ..ProxyConfig::default()
    });
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let mut client = TcpStream::connect(listener.local_addr())
        .await
        .expect("connect proxy");
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("send CONNECT");

    let established = read_head(&mut client).await;
    assert!(String::from_utf8_lossy(&established)
        .starts_with("HTTP/1.1 200 Connection Established"));

    client.write_all(b"ping").await.expect("send ping");
    let mut pong = [0_u8; 4];
    client.read_exact(&mut pong).await.expect("read pong");
    assert_eq!(&pong, b"pong");
    drop(client);

    upstream_task.await.expect("upstream join");
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upstream_connect_rejection_becomes_a_502() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_port = upstream.local_addr().expect("upstream addr").port();
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.expect("accept");
        let _ = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .await
            .expect("reject CONNECT");
    });

    let engine = build_engine(ProxyConfig {
        intercept_tls: false,
        upstream_proxy: Some(UpstreamProxy {
            host: "127.0.0.1".to_string(),
            port: upstream_port,
        }),
        ..ProxyConfig::default()
    });
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let mut client = TcpStream::connect(listener.local_addr())
        .await
        .expect("connect proxy");
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("send CONNECT");

    let response = read_head(&mut client).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502 Bad Gateway"));

    let records = wait_for_records(&engine, 1).await;
    let record = &records[0];
    assert_eq!(record.method, "CONNECT");
    assert_eq!(record.status, None);
    assert!(record
        .error
        .as_deref()
        .expect("error recorded")
        .starts_with("upstream_protocol"));

    upstream_task.await.expect("upstream join");
    listener.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_upgrade_produces_frame_records() {
    const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_port = origin.local_addr().expect("origin addr").port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.expect("accept");
        let _ = read_head(&mut stream).await;
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(CLIENT_KEY)
        );
        stream
            .write_all(response.as_bytes())
            .await
            .expect("write 101");

        // Client text frame "hi": 2 header bytes, 4 mask bytes, 2 payload.
        let mut frame = [0_u8; 8];
        stream.read_exact(&mut frame).await.expect("read client frame");
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1] & 0x80, 0x80);

        let reply = build_frame(true, Opcode::Text, b"hello", None);
        stream.write_all(&reply).await.expect("write server frame");
        let mut bin = [0_u8; 64];
        let _ = stream.read(&mut bin).await;
    });

    let engine = build_engine(ProxyConfig::default());
    let listener = Listener::bind(Arc::clone(&engine)).await.expect("bind proxy");

    let mut client = TcpStream::connect(listener.local_addr())
        .await
        .expect("connect proxy");
    let request = format!(
        "GET http://127.0.0.1:{origin_port}/ws HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {CLIENT_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send upgrade");

    let response = read_head(&mut client).await;
    let response_text = String::from_utf8_lossy(&response).to_string();
    assert!(response_text.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(response_text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    let hi = build_frame(true, Opcode::Text, b"hi", Some([0xA1, 0xB2, 0xC3, 0xD4]));
    client.write_all(&hi).await.expect("send client frame");

    let mut header = [0_u8; 2];
    client.read_exact(&mut header).await.expect("read frame header");
    assert_eq!(header[0], 0x81);
    assert_eq!(header[1], 5);
    let mut payload = [0_u8; 5];
    client.read_exact(&mut payload).await.expect("read frame payload");
    assert_eq!(&payload, b"hello");

    // A Ping is answered by the relay itself; the origin never sees it.
    let ping = build_frame(true, Opcode::Ping, b"tick", Some([0x01, 0x02, 0x03, 0x04]));
    client.write_all(&ping).await.expect("send ping");
    let mut pong_header = [0_u8; 2];
    client
        .read_exact(&mut pong_header)
        .await
        .expect("read pong header");
    assert_eq!(pong_header[0], 0x8A);
    assert_eq!(pong_header[1], 4);
    let mut pong_payload = [0_u8; 4];
    client
        .read_exact(&mut pong_payload)
        .await
        .expect("read pong payload");
    assert_eq!(&pong_payload, b"tick");

    let records = wait_for_records(&engine, 1).await;
    let upgrade = &records[0];
    assert_eq!(upgrade.protocol, Protocol::Ws);
    assert_eq!(upgrade.status, Some(101));

    let mut frames = Vec::new();
    for _ in 0..200 {
        frames = engine
            .store()
            .frames_for_connection(&upgrade.connection_id)
            .expect("list frames");
        if frames.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(frames.len() >= 3, "expected text and ping frame records");
    let client_frame = frames
        .iter()
        .find(|frame| frame.direction == "client_to_server")
        .expect("client frame recorded");
    assert_eq!(client_frame.opcode, 0x1);
    assert_eq!(client_frame.payload, b"hi");
    let server_frame = frames
        .iter()
        .find(|frame| frame.direction == "server_to_client")
        .expect("server frame recorded");
    assert_eq!(server_frame.opcode, 0x1);
    assert_eq!(server_frame.payload, b"hello");
    let ping_frame = frames
        .iter()
        .find(|frame| frame.opcode == 0x9)
        .expect("ping frame recorded");
    assert_eq!(ping_frame.direction, "client_to_server");
    assert_eq!(ping_frame.payload, b"tick");

    drop(client);
    origin_task.await.expect("origin join");
    listener.shutdown().await;
}
