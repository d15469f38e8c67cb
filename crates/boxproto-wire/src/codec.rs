//! Frame encoding and the stream framer.
//!
//! `encode_request` writes the 5-byte size reservation, the header map, and
//! the body map, then patches the real length into bytes 1..5. `read_frame`
//! splits one length-prefixed packet off an async byte stream.

use std::fmt::Display;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::consts::{body_key, header_key};
use crate::error::{WireError, WireResult};
use crate::request::{IndexRef, Request, SpaceRef, Statement};

/// Upper bound on a single frame; guards against corrupt length prefixes.
pub const MAX_FRAME_LEN: usize = 64 << 20;

fn enc(e: impl Display) -> WireError {
    WireError::Encode(e.to_string())
}

fn wmap(buf: &mut Vec<u8>, len: u32) -> WireResult<()> {
    rmp::encode::write_map_len(buf, len).map_err(enc)?;
    Ok(())
}

fn wu(buf: &mut Vec<u8>, val: u64) -> WireResult<()> {
    rmp::encode::write_uint(buf, val).map_err(enc)?;
    Ok(())
}

fn wkey(buf: &mut Vec<u8>, key: u8) -> WireResult<()> {
    wu(buf, key as u64)
}

fn wstr(buf: &mut Vec<u8>, val: &str) -> WireResult<()> {
    rmp::encode::write_str(buf, val).map_err(enc)?;
    Ok(())
}

fn wbool(buf: &mut Vec<u8>, val: bool) -> WireResult<()> {
    rmp::encode::write_bool(buf, val).map_err(enc)?;
    Ok(())
}

fn wf64(buf: &mut Vec<u8>, val: f64) -> WireResult<()> {
    rmp::encode::write_f64(buf, val).map_err(enc)?;
    Ok(())
}

fn warray(buf: &mut Vec<u8>, len: u32) -> WireResult<()> {
    rmp::encode::write_array_len(buf, len).map_err(enc)?;
    Ok(())
}

/// Writes raw bytes under a MessagePack string header. Used for the auth
/// token, which the protocol carries as a string of raw scramble bytes.
fn wstr_bytes(buf: &mut Vec<u8>, val: &[u8]) -> WireResult<()> {
    rmp::encode::write_str_len(buf, val.len() as u32).map_err(enc)?;
    buf.extend_from_slice(val);
    Ok(())
}

fn wspace(buf: &mut Vec<u8>, space: &SpaceRef) -> WireResult<()> {
    match space {
        SpaceRef::Id(id) => {
            wkey(buf, body_key::SPACE_ID)?;
            wu(buf, *id as u64)
        }
        SpaceRef::Name(name) => {
            wkey(buf, body_key::SPACE_NAME)?;
            wstr(buf, name)
        }
    }
}

fn windex(buf: &mut Vec<u8>, index: &IndexRef) -> WireResult<()> {
    match index {
        IndexRef::Id(id) => {
            wkey(buf, body_key::INDEX_ID)?;
            wu(buf, *id as u64)
        }
        IndexRef::Name(name) => {
            wkey(buf, body_key::INDEX_NAME)?;
            wstr(buf, name)
        }
    }
}

/// Encodes one request as a complete frame appended to `buf`.
///
/// `sync` is ignored for fire-and-forget requests; the stream id is written
/// only when bound. The size prefix exactly reflects the payload length.
pub fn encode_request(
    req: &Request,
    sync: Option<u64>,
    stream_id: Option<u64>,
    buf: &mut Vec<u8>,
) -> WireResult<()> {
    let start = buf.len();
    // Size reservation: uint32 marker plus four length bytes, patched below.
    buf.extend_from_slice(&[0xce, 0, 0, 0, 0]);

    let sync = if req.is_fire_and_forget() { None } else { sync };
    let header_len = 1 + sync.is_some() as u32 + stream_id.is_some() as u32;
    wmap(buf, header_len)?;
    wkey(buf, header_key::REQUEST_TYPE)?;
    wu(buf, req.request_type() as u64)?;
    if let Some(sync) = sync {
        wkey(buf, header_key::SYNC)?;
        wu(buf, sync)?;
    }
    if let Some(sid) = stream_id {
        wkey(buf, header_key::STREAM_ID)?;
        wu(buf, sid)?;
    }

    encode_body(req, buf)?;

    let total = buf.len() - start;
    let len = (total - 5) as u32;
    buf[start + 1..start + 5].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn encode_body(req: &Request, buf: &mut Vec<u8>) -> WireResult<()> {
    match req {
        Request::Auth {
            user,
            method,
            token,
        } => encode_auth(buf, user, method, token),
        Request::Ping | Request::Commit | Request::Rollback => wmap(buf, 0),
        Request::Call { function, args } => encode_call(buf, function, args),
        Request::Eval { expr, args } => encode_eval(buf, expr, args),
        Request::Select {
            space,
            index,
            limit,
            offset,
            iterator,
            key,
            fetch_position,
            after_position,
            after_tuple,
        } => encode_select(
            buf,
            space,
            index,
            *limit,
            *offset,
            *iterator as u32,
            key,
            *fetch_position,
            after_position.as_deref(),
            after_tuple.as_deref(),
        ),
        Request::Insert { space, tuple } | Request::Replace { space, tuple } => {
            encode_store(buf, space, tuple)
        }
        Request::Update {
            space,
            index,
            key,
            ops,
        } => encode_update(buf, space, index, key, ops),
        Request::Upsert { space, tuple, ops } => encode_upsert(buf, space, tuple, ops),
        Request::Delete { space, index, key } => encode_delete(buf, space, index, key),
        Request::Begin { timeout, isolation } => encode_begin(buf, *timeout, *isolation),
        Request::Execute { statement, bind } => encode_execute(buf, statement, bind.as_deref()),
        Request::Prepare { sql } => encode_prepare(buf, sql),
        Request::Id { version, features } => encode_id(buf, *version, features),
        Request::Watch { key } | Request::Unwatch { key } | Request::WatchOnce { key } => {
            encode_event_key(buf, key)
        }
    }
}

fn encode_auth(buf: &mut Vec<u8>, user: &str, method: &str, token: &[u8]) -> WireResult<()> {
    wmap(buf, 2)?;
    wkey(buf, body_key::USER_NAME)?;
    wstr(buf, user)?;
    wkey(buf, body_key::TUPLE)?;
    warray(buf, 2)?;
    wstr(buf, method)?;
    wstr_bytes(buf, token)
}

fn encode_call(buf: &mut Vec<u8>, function: &str, args: &[u8]) -> WireResult<()> {
    wmap(buf, 2)?;
    wkey(buf, body_key::FUNCTION_NAME)?;
    wstr(buf, function)?;
    wkey(buf, body_key::TUPLE)?;
    buf.extend_from_slice(args);
    Ok(())
}

fn encode_eval(buf: &mut Vec<u8>, expr: &str, args: &[u8]) -> WireResult<()> {
    wmap(buf, 2)?;
    wkey(buf, body_key::EXPR)?;
    wstr(buf, expr)?;
    wkey(buf, body_key::TUPLE)?;
    buf.extend_from_slice(args);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_select(
    buf: &mut Vec<u8>,
    space: &SpaceRef,
    index: &IndexRef,
    limit: u32,
    offset: u32,
    iterator: u32,
    key: &[u8],
    fetch_position: bool,
    after_position: Option<&[u8]>,
    after_tuple: Option<&[u8]>,
) -> WireResult<()> {
    let len = 6
        + fetch_position as u32
        + after_position.is_some() as u32
        + after_tuple.is_some() as u32;
    wmap(buf, len)?;
    wspace(buf, space)?;
    windex(buf, index)?;
    wkey(buf, body_key::LIMIT)?;
    wu(buf, limit as u64)?;
    wkey(buf, body_key::OFFSET)?;
    wu(buf, offset as u64)?;
    wkey(buf, body_key::ITERATOR)?;
    wu(buf, iterator as u64)?;
    wkey(buf, body_key::KEY)?;
    buf.extend_from_slice(key);
    if fetch_position {
        wkey(buf, body_key::FETCH_POSITION)?;
        wbool(buf, true)?;
    }
    if let Some(pos) = after_position {
        wkey(buf, body_key::AFTER_POSITION)?;
        buf.extend_from_slice(pos);
    }
    if let Some(tuple) = after_tuple {
        wkey(buf, body_key::AFTER_TUPLE)?;
        buf.extend_from_slice(tuple);
    }
    Ok(())
}

fn encode_store(buf: &mut Vec<u8>, space: &SpaceRef, tuple: &[u8]) -> WireResult<()> {
    wmap(buf, 2)?;
    wspace(buf, space)?;
    wkey(buf, body_key::TUPLE)?;
    buf.extend_from_slice(tuple);
    Ok(())
}

fn encode_update(
    buf: &mut Vec<u8>,
    space: &SpaceRef,
    index: &IndexRef,
    key: &[u8],
    ops: &[u8],
) -> WireResult<()> {
    wmap(buf, 4)?;
    wspace(buf, space)?;
    windex(buf, index)?;
    wkey(buf, body_key::KEY)?;
    buf.extend_from_slice(key);
    wkey(buf, body_key::OPS)?;
    buf.extend_from_slice(ops);
    Ok(())
}

fn encode_upsert(buf: &mut Vec<u8>, space: &SpaceRef, tuple: &[u8], ops: &[u8]) -> WireResult<()> {
    wmap(buf, 3)?;
    wspace(buf, space)?;
    wkey(buf, body_key::TUPLE)?;
    buf.extend_from_slice(tuple);
    wkey(buf, body_key::OPS)?;
    buf.extend_from_slice(ops);
    Ok(())
}

fn encode_delete(buf: &mut Vec<u8>, space: &SpaceRef, index: &IndexRef, key: &[u8]) -> WireResult<()> {
    wmap(buf, 3)?;
    wspace(buf, space)?;
    windex(buf, index)?;
    wkey(buf, body_key::KEY)?;
    buf.extend_from_slice(key);
    Ok(())
}

fn encode_begin(buf: &mut Vec<u8>, timeout: Option<f64>, isolation: Option<u32>) -> WireResult<()> {
    wmap(buf, timeout.is_some() as u32 + isolation.is_some() as u32)?;
    if let Some(secs) = timeout {
        wkey(buf, body_key::TIMEOUT)?;
        wf64(buf, secs)?;
    }
    if let Some(level) = isolation {
        wkey(buf, body_key::TXN_ISOLATION)?;
        wu(buf, level as u64)?;
    }
    Ok(())
}

fn encode_execute(buf: &mut Vec<u8>, statement: &Statement, bind: Option<&[u8]>) -> WireResult<()> {
    wmap(buf, 1 + bind.is_some() as u32)?;
    match statement {
        Statement::Sql(sql) => {
            wkey(buf, body_key::SQL_TEXT)?;
            wstr(buf, sql)?;
        }
        Statement::Prepared(id) => {
            wkey(buf, body_key::STMT_ID)?;
            wu(buf, *id)?;
        }
    }
    if let Some(bind) = bind {
        wkey(buf, body_key::SQL_BIND)?;
        buf.extend_from_slice(bind);
    }
    Ok(())
}

fn encode_prepare(buf: &mut Vec<u8>, sql: &str) -> WireResult<()> {
    wmap(buf, 1)?;
    wkey(buf, body_key::SQL_TEXT)?;
    wstr(buf, sql)
}

fn encode_id(buf: &mut Vec<u8>, version: u64, features: &[u64]) -> WireResult<()> {
    wmap(buf, 2)?;
    wkey(buf, body_key::VERSION)?;
    wu(buf, version)?;
    wkey(buf, body_key::FEATURES)?;
    warray(buf, features.len() as u32)?;
    for feature in features {
        wu(buf, *feature)?;
    }
    Ok(())
}

fn encode_event_key(buf: &mut Vec<u8>, key: &str) -> WireResult<()> {
    wmap(buf, 1)?;
    wkey(buf, body_key::EVENT_KEY)?;
    wstr(buf, key)
}

/// Reads one length-prefixed frame and returns its payload (header + body
/// maps, without the size prefix).
///
/// Accepts any MessagePack unsigned-integer encoding of the length, not
/// just the `0xce` form this codec writes.
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> WireResult<Vec<u8>> {
    let mut marker = [0u8; 1];
    rd.read_exact(&mut marker).await?;
    let len = match marker[0] {
        m @ 0x00..=0x7f => m as usize,
        0xcc => {
            let mut b = [0u8; 1];
            rd.read_exact(&mut b).await?;
            b[0] as usize
        }
        0xcd => {
            let mut b = [0u8; 2];
            rd.read_exact(&mut b).await?;
            u16::from_be_bytes(b) as usize
        }
        0xce => {
            let mut b = [0u8; 4];
            rd.read_exact(&mut b).await?;
            u32::from_be_bytes(b) as usize
        }
        0xcf => {
            let mut b = [0u8; 8];
            rd.read_exact(&mut b).await?;
            let len = u64::from_be_bytes(b);
            usize::try_from(len)
                .map_err(|_| WireError::Malformed(format!("frame length {len} out of range")))?
        }
        m => {
            return Err(WireError::Malformed(format!(
                "invalid frame length marker 0x{m:02x}"
            )));
        }
    };
    if len > MAX_FRAME_LEN {
        return Err(WireError::Malformed(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    rd.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::response_key;
    use crate::request::IteratorType;
    use rmpv::Value;

    fn size_field(buf: &[u8]) -> u32 {
        assert_eq!(buf[0], 0xce);
        u32::from_be_bytes(buf[1..5].try_into().unwrap())
    }

    fn decode_maps(frame: &[u8]) -> (Vec<(Value, Value)>, Vec<(Value, Value)>) {
        let mut cur = &frame[5..];
        let header = rmpv::decode::read_value(&mut cur).unwrap();
        let body = rmpv::decode::read_value(&mut cur).unwrap();
        assert!(cur.is_empty(), "trailing bytes after body");
        match (header, body) {
            (Value::Map(h), Value::Map(b)) => (h, b),
            other => panic!("expected two maps, got {other:?}"),
        }
    }

    fn lookup<'a>(map: &'a [(Value, Value)], key: u64) -> Option<&'a Value> {
        map.iter()
            .find(|(k, _)| k.as_u64() == Some(key))
            .map(|(_, v)| v)
    }

    fn encode(req: &Request, sync: Option<u64>, stream_id: Option<u64>) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_request(req, sync, stream_id, &mut buf).unwrap();
        buf
    }

    #[test]
    fn size_prefix_equals_total_minus_five() {
        // Checked across representative request kinds.
        let requests = [
            Request::Ping,
            Request::Call {
                function: "box.info".into(),
                args: vec![0x90],
            },
            Request::select(
                SpaceRef::Name("users".into()),
                IndexRef::Id(0),
                IteratorType::Ge,
                vec![0x91, 0x01],
            ),
            Request::Insert {
                space: SpaceRef::Id(512),
                tuple: vec![0x92, 0x01, 0x02],
            },
            Request::Watch {
                key: "box.status".into(),
            },
            Request::Execute {
                statement: Statement::Sql("SELECT 1".into()),
                bind: None,
            },
        ];
        for req in &requests {
            let buf = encode(req, Some(9), None);
            assert_eq!(
                size_field(&buf) as usize,
                buf.len() - 5,
                "bad size field for {req:?}"
            );
        }
    }

    #[test]
    fn header_carries_type_sync_and_optional_stream() {
        let buf = encode(&Request::Ping, Some(42), None);
        let (header, body) = decode_maps(&buf);
        assert_eq!(lookup(&header, 0x00).unwrap().as_u64(), Some(0x40));
        assert_eq!(lookup(&header, 0x01).unwrap().as_u64(), Some(42));
        assert!(lookup(&header, 0x0a).is_none());
        assert!(body.is_empty());

        let buf = encode(&Request::Commit, Some(7), Some(3));
        let (header, _) = decode_maps(&buf);
        assert_eq!(lookup(&header, 0x0a).unwrap().as_u64(), Some(3));
    }

    #[test]
    fn watch_frames_have_no_sync() {
        let buf = encode(
            &Request::Watch {
                key: "box.id".into(),
            },
            Some(5),
            None,
        );
        let (header, body) = decode_maps(&buf);
        assert!(lookup(&header, 0x01).is_none(), "watch must not carry sync");
        assert_eq!(
            lookup(&body, response_key::EVENT_KEY as u64)
                .unwrap()
                .as_str(),
            Some("box.id")
        );
    }

    #[test]
    fn select_body_fields() {
        let req = Request::Select {
            space: SpaceRef::Id(280),
            index: IndexRef::Name("pk".into()),
            limit: 10,
            offset: 2,
            iterator: IteratorType::Gt,
            key: vec![0x91, 0x05],
            fetch_position: true,
            after_position: None,
            after_tuple: None,
        };
        let buf = encode(&req, Some(1), None);
        let (_, body) = decode_maps(&buf);
        assert_eq!(lookup(&body, 0x10).unwrap().as_u64(), Some(280));
        assert_eq!(lookup(&body, 0x5f).unwrap().as_str(), Some("pk"));
        assert_eq!(lookup(&body, 0x12).unwrap().as_u64(), Some(10));
        assert_eq!(lookup(&body, 0x13).unwrap().as_u64(), Some(2));
        assert_eq!(lookup(&body, 0x14).unwrap().as_u64(), Some(6));
        assert_eq!(lookup(&body, 0x1f).unwrap().as_bool(), Some(true));
        let key = lookup(&body, 0x20).unwrap();
        assert_eq!(key, &Value::Array(vec![Value::from(5)]));
    }

    #[test]
    fn update_body_uses_key_and_ops() {
        let req = Request::Update {
            space: SpaceRef::Id(280),
            index: IndexRef::Id(0),
            key: vec![0x91, 0x01],
            ops: vec![0x90],
        };
        let buf = encode(&req, Some(1), None);
        let (_, body) = decode_maps(&buf);
        assert!(lookup(&body, 0x20).is_some());
        assert!(lookup(&body, 0x28).is_some());
        assert_eq!(body.len(), 4);
    }

    #[test]
    fn auth_body_shape() {
        let req = Request::Auth {
            user: "app".into(),
            method: "chap-sha1".into(),
            token: vec![0xff; 20],
        };
        let buf = encode(&req, Some(0), None);
        let (_, body) = decode_maps(&buf);
        assert_eq!(lookup(&body, 0x23).unwrap().as_str(), Some("app"));
        let tuple = match lookup(&body, 0x21).unwrap() {
            Value::Array(items) => items,
            other => panic!("expected array, got {other:?}"),
        };
        assert_eq!(tuple[0].as_str(), Some("chap-sha1"));
        // Scramble bytes are not valid UTF-8; they still travel as a string.
        match &tuple[1] {
            Value::String(s) => assert_eq!(s.as_bytes(), &[0xff; 20][..]),
            other => panic!("expected string token, got {other:?}"),
        }
    }

    #[test]
    fn begin_body_is_empty_without_options() {
        let buf = encode(
            &Request::Begin {
                timeout: None,
                isolation: None,
            },
            Some(1),
            Some(8),
        );
        let (_, body) = decode_maps(&buf);
        assert!(body.is_empty());

        let buf = encode(
            &Request::Begin {
                timeout: Some(0.5),
                isolation: Some(1),
            },
            Some(1),
            Some(8),
        );
        let (_, body) = decode_maps(&buf);
        assert_eq!(lookup(&body, 0x56).unwrap().as_f64(), Some(0.5));
        assert_eq!(lookup(&body, 0x59).unwrap().as_u64(), Some(1));
    }

    #[tokio::test]
    async fn read_frame_splits_packets() {
        let mut stream = Vec::new();
        encode_request(&Request::Ping, Some(1), None, &mut stream).unwrap();
        encode_request(
            &Request::Call {
                function: "f".into(),
                args: vec![0x90],
            },
            Some(2),
            None,
            &mut stream,
        )
        .unwrap();

        let mut rd = &stream[..];
        let first = read_frame(&mut rd).await.unwrap();
        let second = read_frame(&mut rd).await.unwrap();
        assert!(rd.is_empty());

        let mut cur = &first[..];
        let header = rmpv::decode::read_value(&mut cur).unwrap();
        match header {
            Value::Map(entries) => {
                assert_eq!(lookup(&entries, 0x01).unwrap().as_u64(), Some(1))
            }
            other => panic!("expected map, got {other:?}"),
        }
        assert!(!second.is_empty());
    }

    #[tokio::test]
    async fn read_frame_accepts_short_length_markers() {
        // Fixint length prefix followed by that many bytes.
        let stream = [0x03, 0xaa, 0xbb, 0xcc];
        let mut rd = &stream[..];
        let frame = read_frame(&mut rd).await.unwrap();
        assert_eq!(frame, vec![0xaa, 0xbb, 0xcc]);

        // uint16 form.
        let mut stream = vec![0xcd, 0x00, 0x02];
        stream.extend_from_slice(&[0x01, 0x02]);
        let mut rd = &stream[..];
        let frame = read_frame(&mut rd).await.unwrap();
        assert_eq!(frame, vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn read_frame_rejects_bad_marker() {
        let stream = [0xc1u8, 0x00];
        let mut rd = &stream[..];
        let err = read_frame(&mut rd).await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[tokio::test]
    async fn read_frame_reports_truncation() {
        let mut stream = Vec::new();
        encode_request(&Request::Ping, Some(1), None, &mut stream).unwrap();
        stream.truncate(stream.len() - 2);
        let mut rd = &stream[..];
        let err = read_frame(&mut rd).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}
