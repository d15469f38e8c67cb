//! In-process mock IPROTO server for the pool tests.
//!
//! Serves any number of connections and counts them, so tests can observe
//! the pool opening and closing sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use boxproto_wire::read_frame;

const SALT_B64: &str = "MDEyMzQ1Njc4OWFiY2RlZmdoaWprbG1ub3BxcnN0dXY=";

/// Installs the test tracing subscriber; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the server answers ping probes.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Every ping succeeds.
    Healthy,
    /// The first `n` pings of each connection succeed, the rest fail.
    FailPingsAfter(usize),
}

pub struct MockServer {
    pub addr: SocketAddr,
    /// Connections accepted over the server's lifetime.
    pub accepted: Arc<AtomicUsize>,
    /// Connections currently open.
    pub active: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server(behavior: Behavior) -> MockServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));

    let handle = {
        let accepted = accepted.clone();
        let active = active.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                active.fetch_add(1, Ordering::SeqCst);
                let active = active.clone();
                tokio::spawn(async move {
                    serve_conn(stream, behavior).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        })
    };

    MockServer {
        addr,
        accepted,
        active,
        handle,
    }
}

async fn serve_conn(mut stream: TcpStream, behavior: Behavior) {
    let mut banner = [b' '; 128];
    let line1 = b"Boxproto 3.1 (Binary) mock";
    banner[..line1.len()].copy_from_slice(line1);
    banner[63] = b'\n';
    banner[64..64 + SALT_B64.len()].copy_from_slice(SALT_B64.as_bytes());
    banner[127] = b'\n';
    if stream.write_all(&banner).await.is_err() {
        return;
    }

    let mut pings = 0usize;
    while let Ok(raw) = read_frame(&mut stream).await {
        let (request_type, sync) = parse_header(&raw);
        let reply = match request_type {
            // Ping: healthy or failing per the configured behavior.
            0x40 => {
                pings += 1;
                let fail = matches!(behavior, Behavior::FailPingsAfter(n) if pings > n);
                if fail {
                    error_response(sync, 77, "instance unhealthy")
                } else {
                    ok_response(sync)
                }
            }
            // Auth and everything else: plain acknowledgement.
            _ => ok_response(sync),
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn parse_header(frame: &[u8]) -> (u64, Option<u64>) {
    let mut cur = frame;
    let header = rmpv::decode::read_value(&mut cur).unwrap();
    let Value::Map(header) = header else {
        panic!("header is not a map: {header:?}");
    };
    let field = |key: u64| {
        header
            .iter()
            .find(|(k, _)| k.as_u64() == Some(key))
            .and_then(|(_, v)| v.as_u64())
    };
    (field(0x00).expect("request type"), field(0x01))
}

fn response_frame(code: u64, sync: Option<u64>, body: &[(u64, Value)]) -> Vec<u8> {
    let mut buf = vec![0xce, 0, 0, 0, 0];
    let header_len = 1 + sync.is_some() as u32;
    rmp::encode::write_map_len(&mut buf, header_len).unwrap();
    rmp::encode::write_uint(&mut buf, 0x00).unwrap();
    rmp::encode::write_uint(&mut buf, code).unwrap();
    if let Some(sync) = sync {
        rmp::encode::write_uint(&mut buf, 0x01).unwrap();
        rmp::encode::write_uint(&mut buf, sync).unwrap();
    }
    rmp::encode::write_map_len(&mut buf, body.len() as u32).unwrap();
    for (key, value) in body {
        rmp::encode::write_uint(&mut buf, *key).unwrap();
        rmpv::encode::write_value(&mut buf, value).unwrap();
    }
    let len = (buf.len() - 5) as u32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn ok_response(sync: Option<u64>) -> Vec<u8> {
    response_frame(0, sync, &[])
}

fn error_response(sync: Option<u64>, code: u64, message: &str) -> Vec<u8> {
    response_frame(0x8000 | code, sync, &[(0x31, Value::from(message))])
}

/// An address nothing listens on; connecting to it is refused immediately.
pub async fn dead_addr() -> SocketAddr {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Polls `check` until it holds or five seconds pass.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
