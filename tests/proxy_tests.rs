//! End-to-end scenarios from spec §8, driven against real loopback sockets.
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tcpforward::{Action, AlterDownstream, Endpoint, Handler, Passthrough, Proxy, Session};

async fn spawn_echo_upstream() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    Endpoint::new(addr.ip().to_string(), addr.port())
}

fn loopback_any() -> Endpoint {
    Endpoint::new("127.0.0.1", 0)
}

async fn connect(proxy: &Proxy) -> TcpStream {
    let addr = proxy.local_addr().expect("proxy bound successfully");
    TcpStream::connect(addr).await.unwrap()
}

#[tokio::test]
async fn passthrough_echoes_bytes_unchanged() {
    let upstream = spawn_echo_upstream().await;
    let mut proxy = Proxy::new(upstream, loopback_any(), Passthrough);

    let mut client = connect(&proxy).await;
    client.write_all(b"hello, world").await.unwrap();

    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello, world");

    proxy.stop(true);
}

#[tokio::test]
async fn handler_rewrites_only_the_client_to_server_direction() {
    let upstream = spawn_echo_upstream().await;
    let handler = AlterDownstream(|data: &[u8]| {
        Bytes::from(String::from_utf8_lossy(data).to_uppercase().into_bytes())
    });
    let mut proxy = Proxy::new(upstream, loopback_any(), handler);

    let mut client = connect(&proxy).await;
    client.write_all(b"shout please").await.unwrap();

    // The fake upstream echoes verbatim, so what comes back is the
    // *rewritten* bytes: proof the rewrite happened on the way to upstream,
    // not on the way back.
    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"SHOUT PLEASE");

    proxy.stop(true);
}

#[tokio::test]
async fn half_close_drains_pending_reply_before_fully_closing() {
    // A slow-reply upstream: reads everything the client sends, waits for
    // EOF on its own read side (i.e. the proxy closing its write-to-upstream
    // half), then sends one reply line and closes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match sock.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => return,
            }
        }
        assert_eq!(received, b"abc");
        let _ = sock.write_all(b"reply").await;
    });
    let upstream = Endpoint::new(addr.ip().to_string(), addr.port());

    let mut proxy = Proxy::new(upstream, loopback_any(), Passthrough);
    let mut client = connect(&proxy).await;

    client.write_all(b"abc").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"reply");

    proxy.stop(true);
}

#[tokio::test]
async fn broken_upstream_closes_downstream_cleanly() {
    // Bind then immediately drop the listener so the port refuses
    // connections: upstream connect fails for every session.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let upstream = Endpoint::new(addr.ip().to_string(), addr.port());

    let mut proxy = Proxy::new(upstream, loopback_any(), Passthrough);
    let mut client = connect(&proxy).await;

    client.write_all(b"x").await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("proxy should close downstream instead of hanging")
        .unwrap();
    assert_eq!(n, 0, "downstream should observe a clean EOF");

    proxy.stop(true);
}

#[tokio::test]
async fn concurrent_sessions_each_get_their_own_bytes_back() {
    let upstream = spawn_echo_upstream().await;
    let mut proxy = Proxy::new(upstream, loopback_any(), Passthrough);

    let mut tasks = Vec::new();
    for i in 0..10u8 {
        let addr = proxy.local_addr().unwrap();
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 1024];
            let mut sock = TcpStream::connect(addr).await.unwrap();
            sock.write_all(&payload).await.unwrap();
            let mut received = vec![0u8; 1024];
            sock.read_exact(&mut received).await.unwrap();
            assert_eq!(received, payload, "session {i} got someone else's bytes");
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    proxy.stop(true);
}

#[tokio::test]
async fn stop_while_idle_shuts_down_cleanly() {
    let upstream = spawn_echo_upstream().await;
    let mut proxy = Proxy::new(upstream, loopback_any(), Passthrough);
    assert!(proxy.local_addr().is_some());
    proxy.stop(true);
    assert!(proxy.wait_for().is_ok());
}

struct CountingHandler;

impl Handler for CountingHandler {
    fn handle_upstream_data(&self, _session: &Session, _data: &[u8]) -> Vec<Action> {
        vec![Action::CopyAsIs]
    }

    fn handle_downstream_data(&self, _session: &Session, data: &[u8]) -> Vec<Action> {
        assert!(!data.is_empty());
        vec![Action::CopyAsIs]
    }
}

#[tokio::test]
async fn handler_observes_every_chunk_sent_by_the_client() {
    let upstream = spawn_echo_upstream().await;
    let mut proxy = Proxy::new(upstream, loopback_any(), CountingHandler);

    let mut client = connect(&proxy).await;
    client.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"one");

    proxy.stop(true);
}
