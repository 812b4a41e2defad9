//! End-to-end exchange scenarios against in-process mock resolvers

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use dns_upstream::{
    msg_id, new_upstream, DnsError, StreamUpstream, Upstream, UpstreamConfig, UpstreamProtocol,
};

// ============================================================================
// Helpers
// ============================================================================

fn build_query(domain: &str, id: u16) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    let name = Name::from_str(domain).unwrap();
    message.add_query(Query::query(name, RecordType::A));
    message.to_vec().unwrap()
}

/// Answer a query with an A record for 93.184.216.34, echoing the wire ID.
fn build_a_reply(query_bytes: &[u8]) -> Vec<u8> {
    let query = Message::from_vec(query_bytes).unwrap();
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    if let Some(q) = query.queries().first() {
        response.add_query(q.clone());
        let record = Record::from_rdata(q.name().clone(), 300, RData::A(A::new(93, 184, 216, 34)));
        response.add_answer(record);
    }
    response.to_vec().unwrap()
}

async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.ok()?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.ok()?;
    Some(buf)
}

async fn write_frame(stream: &mut TcpStream, msg: &[u8]) {
    let len = u16::try_from(msg.len()).unwrap();
    stream.write_all(&len.to_be_bytes()).await.unwrap();
    stream.write_all(msg).await.unwrap();
    stream.flush().await.unwrap();
}

/// UDP resolver that answers every query with an A record.
async fn spawn_udp_resolver() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
            let reply = build_a_reply(&buf[..n]);
            let _ = sock.send_to(&reply, peer).await;
        }
    });
    addr
}

/// TCP resolver that answers every query on every connection, counting
/// accepted connections.
async fn spawn_tcp_resolver(accepts: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            accepts.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(query) = read_frame(&mut stream).await {
                    let reply = build_a_reply(&query);
                    write_frame(&mut stream, &reply).await;
                }
            });
        }
    });
    addr
}

/// DoH resolver behind a self-signed TLS cert, speaking HTTP/1.1. Records
/// every request target; `mangle_reply_id` makes it echo a non-zero ID.
async fn spawn_doh_resolver(
    seen_targets: Arc<Mutex<Vec<String>>>,
    mangle_reply_id: bool,
) -> SocketAddr {
    let cert = rcgen::generate_simple_self_signed(vec!["dns.example".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let seen = Arc::clone(&seen_targets);
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(tcp).await else {
                    return;
                };
                while let Some(target) = read_http_request_target(&mut stream).await {
                    seen.lock().unwrap().push(target.clone());
                    let Some(b64) = target.split("dns=").nth(1) else {
                        break;
                    };
                    let Ok(query) = URL_SAFE_NO_PAD.decode(b64) else {
                        break;
                    };
                    let mut reply = build_a_reply(&query);
                    if mangle_reply_id {
                        reply[0] = 0xAB;
                        reply[1] = 0xCD;
                    }
                    write_http_response(&mut stream, &reply).await;
                }
            });
        }
    });
    addr
}

async fn read_http_request_target<S>(stream: &mut S) -> Option<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&buf);
    let mut parts = text.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    (method == "GET").then(|| target.to_string())
}

async fn write_http_response<S>(stream: &mut S, body: &[u8])
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
}

fn udp_config(addr: SocketAddr) -> UpstreamConfig {
    UpstreamConfig::new("mock-udp", addr.to_string(), UpstreamProtocol::Udp)
}

fn tcp_config(addr: SocketAddr) -> UpstreamConfig {
    UpstreamConfig::new("mock-tcp", addr.to_string(), UpstreamProtocol::Tcp)
}

fn doh_config(addr: SocketAddr, url: &str) -> UpstreamConfig {
    let mut config =
        UpstreamConfig::new("mock-doh", addr.to_string(), UpstreamProtocol::Doh).with_doh_url(url);
    config.insecure_skip_verify = true;
    config
}

// ============================================================================
// UDP Scenarios
// ============================================================================

#[tokio::test]
async fn udp_happy_path_restores_caller_id() {
    let addr = spawn_udp_resolver().await;
    let upstream = new_upstream(&udp_config(addr), None).unwrap();
    let ctx = CancellationToken::new();

    let query = build_query("www.example.com.", 0x1234);
    let (reply, rtt) = upstream.exchange(&ctx, &query).await.unwrap();

    assert_eq!(reply[0], 0x12);
    assert_eq!(reply[1], 0x34);
    assert!(rtt > Duration::ZERO);

    let parsed = Message::from_vec(&reply).unwrap();
    assert_eq!(parsed.id(), 0x1234);
    assert_eq!(parsed.answers().len(), 1);
}

#[tokio::test]
async fn udp_socket_reused_across_queries() {
    let addr = spawn_udp_resolver().await;
    let upstream = StreamUpstream::udp(&udp_config(addr)).unwrap();
    let ctx = CancellationToken::new();

    for id in 1..=3u16 {
        let query = build_query("www.example.com.", id);
        let (reply, _) = upstream.exchange(&ctx, &query).await.unwrap();
        assert_eq!(msg_id(&reply), id);
    }

    assert_eq!(upstream.idle_connections(), 1);
}

#[tokio::test]
async fn udp_concurrent_exchanges_keep_ids_apart() {
    let addr = spawn_udp_resolver().await;
    let upstream = Arc::new(StreamUpstream::udp(&udp_config(addr)).unwrap());

    let mut handles = Vec::new();
    for id in 100..116u16 {
        let upstream = Arc::clone(&upstream);
        handles.push(tokio::spawn(async move {
            let ctx = CancellationToken::new();
            let query = build_query("www.example.com.", id);
            let (reply, _) = upstream.exchange(&ctx, &query).await.unwrap();
            assert_eq!(msg_id(&reply), id);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

// ============================================================================
// TCP Scenarios
// ============================================================================

#[tokio::test]
async fn tcp_happy_path_reuses_one_connection() {
    let accepts = Arc::new(AtomicUsize::new(0));
    let addr = spawn_tcp_resolver(Arc::clone(&accepts)).await;
    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();

    for id in 1..=4u16 {
        let query = build_query("www.example.com.", id);
        let (reply, _) = upstream.exchange(&ctx, &query).await.unwrap();
        assert_eq!(msg_id(&reply), id);
    }

    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.idle_connections(), 1);
}

#[tokio::test]
async fn tcp_stale_reply_is_discarded_on_reused_connection() {
    // On the second query of each connection the resolver first emits the
    // previous reply again (late answer), then the real one.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut prev_reply: Option<Vec<u8>> = None;
                while let Some(query) = read_frame(&mut stream).await {
                    let reply = build_a_reply(&query);
                    if let Some(stale) = prev_reply.take() {
                        write_frame(&mut stream, &stale).await;
                    }
                    write_frame(&mut stream, &reply).await;
                    prev_reply = Some(reply);
                }
            });
        }
    });

    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();

    let (first, _) = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0001))
        .await
        .unwrap();
    assert_eq!(msg_id(&first), 0x0001);

    // Reuses the pooled connection, eats the stale frame, and still gets
    // the right answer.
    let (second, _) = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0002))
        .await
        .unwrap();
    assert_eq!(msg_id(&second), 0x0002);
    assert_eq!(upstream.idle_connections(), 1);
}

#[tokio::test]
async fn tcp_id_mismatch_on_new_connection_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                while let Some(query) = read_frame(&mut stream).await {
                    let mut reply = build_a_reply(&query);
                    // Flip the echoed ID so it can never match.
                    reply[0] ^= 0xFF;
                    reply[1] ^= 0xFF;
                    write_frame(&mut stream, &reply).await;
                }
            });
        }
    });

    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();

    let result = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0003))
        .await;

    assert!(matches!(result, Err(DnsError::IdMismatch)));
    assert_eq!(upstream.idle_connections(), 0);
}

#[tokio::test]
async fn tcp_reused_connection_failure_redials_once() {
    // Each connection answers exactly one query, then closes. The second
    // exchange finds a dead pooled connection and must recover with one
    // fresh dial.
    let accepts = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Some(query) = read_frame(&mut stream).await {
                        let reply = build_a_reply(&query);
                        write_frame(&mut stream, &reply).await;
                    }
                    // drop closes the connection
                });
            }
        });
    }

    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();

    let (first, _) = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0010))
        .await
        .unwrap();
    assert_eq!(msg_id(&first), 0x0010);

    let (second, _) = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0011))
        .await
        .unwrap();
    assert_eq!(msg_id(&second), 0x0011);
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tcp_failure_on_redial_surfaces() {
    // One connection, one answered query, then the resolver goes away
    // entirely: the redial must fail and the error must surface.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        if let Some(query) = read_frame(&mut stream).await {
            let reply = build_a_reply(&query);
            write_frame(&mut stream, &reply).await;
        }
        drop(stream);
        drop(listener);
    });

    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();

    let (first, _) = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0020))
        .await
        .unwrap();
    assert_eq!(msg_id(&first), 0x0020);

    // Give the server task time to tear everything down.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0021))
        .await;
    assert!(result.is_err());
    assert!(result.unwrap_err().is_recoverable());
}

// ============================================================================
// Cancellation Scenarios
// ============================================================================

#[tokio::test]
async fn cancellation_mid_read_returns_promptly_and_closes_connection() {
    // The resolver reads the query and never answers: the read is cut in
    // the length prefix, framing is unknown, the connection is closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_frame(&mut stream).await;
                // hold the connection open, never reply
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        });
    }

    let start = Instant::now();
    let result = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0030))
        .await;

    assert!(matches!(result, Err(DnsError::Cancelled)));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(upstream.idle_connections(), 0);
}

#[tokio::test]
async fn cancellation_with_known_framing_recycles_connection() {
    // The resolver announces a 100-byte reply and delivers 40 bytes, then
    // stalls. Cancelling mid-body leaves a known residue, so the
    // connection goes back to the pool.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_frame(&mut stream).await;
                stream.write_all(&100u16.to_be_bytes()).await.unwrap();
                stream.write_all(&[0u8; 40]).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    let upstream = StreamUpstream::tcp(&tcp_config(addr)).unwrap();
    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.cancel();
        });
    }

    let start = Instant::now();
    let result = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0031))
        .await;

    assert!(matches!(result, Err(DnsError::Cancelled)));
    assert!(start.elapsed() < Duration::from_millis(600));
    assert_eq!(upstream.idle_connections(), 1);
}

// ============================================================================
// DoT Scenarios
// ============================================================================

#[tokio::test]
async fn dot_handshake_timeout_leaves_pool_empty() {
    // Accepts TCP but never speaks TLS; the handshake must give up on its
    // own deadline.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = UpstreamConfig::new("mock-dot", addr.to_string(), UpstreamProtocol::Dot)
        .with_server_name("localhost");
    let upstream = StreamUpstream::dot(&config, None).unwrap();
    let ctx = CancellationToken::new();

    let start = Instant::now();
    let result = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x0040))
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(DnsError::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(2500));
    assert!(elapsed < Duration::from_secs(6));
    assert_eq!(upstream.idle_connections(), 0);
}

// ============================================================================
// DoH Scenarios
// ============================================================================

#[tokio::test]
async fn doh_get_with_existing_query_restores_caller_id() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_doh_resolver(Arc::clone(&seen), false).await;

    let upstream = new_upstream(&doh_config(addr, "https://dns.example/resolve?foo=bar"), None)
        .unwrap();
    let ctx = CancellationToken::new();

    let query = build_query("www.example.com.", 0x1234);
    let (reply, rtt) = upstream.exchange(&ctx, &query).await.unwrap();

    // The caller's ID comes back even though the wire carried zero.
    assert_eq!(reply[0], 0x12);
    assert_eq!(reply[1], 0x34);
    assert!(reply.len() >= 12);
    assert!(rtt > Duration::ZERO);

    let parsed = Message::from_vec(&reply).unwrap();
    assert_eq!(parsed.id(), 0x1234);
    assert_eq!(parsed.answers().len(), 1);

    // The request kept the existing query string and appended the dns
    // parameter, base64url without padding, with the ID zeroed.
    let targets = seen.lock().unwrap();
    let target = targets.first().expect("resolver saw the request");
    assert!(target.starts_with("/resolve?foo=bar&dns="));

    let dns_param = target.split("dns=").nth(1).unwrap();
    assert!(!dns_param.contains('='));
    assert!(!dns_param.contains('+'));
    assert!(!dns_param.contains('/'));

    let wire_query = URL_SAFE_NO_PAD.decode(dns_param).unwrap();
    assert_eq!(&wire_query[..2], &[0x00, 0x00]);
    let parsed_query = Message::from_vec(&wire_query).unwrap();
    assert_eq!(parsed_query.queries().len(), 1);
}

#[tokio::test]
async fn doh_fast_engine_exchanges_through_mock_resolver() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_doh_resolver(Arc::clone(&seen), false).await;

    let config = doh_config(addr, "https://dns.example/dns-query").with_fasthttp(true);
    let upstream = new_upstream(&config, None).unwrap();
    let ctx = CancellationToken::new();

    let query = build_query("www.example.com.", 0x5678);
    let (reply, _rtt) = upstream.exchange(&ctx, &query).await.unwrap();

    assert_eq!(msg_id(&reply), 0x5678);

    let targets = seen.lock().unwrap();
    assert!(targets.first().unwrap().starts_with("/dns-query?dns="));
}

#[tokio::test]
async fn doh_nonzero_reply_id_is_rejected() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_doh_resolver(Arc::clone(&seen), true).await;

    let upstream = new_upstream(&doh_config(addr, "https://dns.example/dns-query"), None).unwrap();
    let ctx = CancellationToken::new();

    let result = upstream
        .exchange(&ctx, &build_query("www.example.com.", 0x9999))
        .await;

    assert!(matches!(result, Err(DnsError::IdMismatch)));
}
