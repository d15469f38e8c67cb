//! In-process mock IPROTO server pieces shared by the integration tests.

#![allow(dead_code)]

use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub use boxproto_wire::read_frame;

/// Installs the test tracing subscriber; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Base64 of the 32-byte salt `0123456789abcdefghijklmnopqrstuv`.
pub const SALT_B64: &str = "MDEyMzQ1Njc4OWFiY2RlZmdoaWprbG1ub3BxcnN0dXY=";

/// Raw salt bytes matching [`SALT_B64`].
pub const SALT: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

/// Builds the 128-byte greeting banner.
pub fn greeting() -> [u8; 128] {
    let mut raw = [b' '; 128];
    let line1 = b"Boxproto 3.1 (Binary) mock";
    raw[..line1.len()].copy_from_slice(line1);
    raw[63] = b'\n';
    raw[64..64 + SALT_B64.len()].copy_from_slice(SALT_B64.as_bytes());
    raw[127] = b'\n';
    raw
}

/// A request frame as seen by the server.
#[derive(Debug)]
pub struct Frame {
    pub request_type: u64,
    pub sync: Option<u64>,
    pub stream_id: Option<u64>,
    pub body: Vec<(Value, Value)>,
}

impl Frame {
    pub fn body_field(&self, key: u64) -> Option<&Value> {
        self.body
            .iter()
            .find(|(k, _)| k.as_u64() == Some(key))
            .map(|(_, v)| v)
    }
}

/// Parses a frame payload (without the size prefix).
pub fn parse(frame: &[u8]) -> Frame {
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
    let request_type = field(0x00).expect("request type");
    let sync = field(0x01);
    let stream_id = field(0x0a);

    let body = if cur.is_empty() {
        Vec::new()
    } else {
        match rmpv::decode::read_value(&mut cur).unwrap() {
            Value::Map(entries) => entries,
            other => panic!("body is not a map: {other:?}"),
        }
    };

    Frame {
        request_type,
        sync,
        stream_id,
        body,
    }
}

/// Builds one response frame, size prefix included.
pub fn response_frame(code: u64, sync: Option<u64>, body: &[(u64, Value)]) -> Vec<u8> {
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

pub fn ok_response(sync: u64, data: Option<Value>) -> Vec<u8> {
    match data {
        Some(data) => response_frame(0, Some(sync), &[(0x30, data)]),
        None => response_frame(0, Some(sync), &[]),
    }
}

pub fn error_response(sync: Option<u64>, code: u64, message: &str) -> Vec<u8> {
    response_frame(0x8000 | code, sync, &[(0x31, Value::from(message))])
}

/// An out-of-band event frame: no sync in the header.
pub fn event_frame(key: &str, data: Value) -> Vec<u8> {
    response_frame(0x4c, None, &[(0x57, Value::from(key)), (0x58, data)])
}

/// Sends the greeting banner.
pub async fn send_greeting(stream: &mut TcpStream) {
    stream.write_all(&greeting()).await.unwrap();
}

/// Reads the auth frame and acknowledges it, returning the frame so the
/// test can assert on the credentials.
pub async fn accept_auth(stream: &mut TcpStream) -> Frame {
    let raw = read_frame(stream).await.unwrap();
    let frame = parse(&raw);
    assert_eq!(frame.request_type, 0x07, "expected auth frame");
    let ack = response_frame(0, frame.sync, &[]);
    stream.write_all(&ack).await.unwrap();
    frame
}
