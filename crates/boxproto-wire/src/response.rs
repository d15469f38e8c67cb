//! Response model — decoded header plus keyed body fields.

use std::collections::HashMap;

use rmpv::Value;

use crate::consts::{header_key, response_key, ERROR_TYPE_FLAG};
use crate::error::{WireError, WireResult};

/// One decoded response frame.
///
/// A frame whose header carries no sync key is an out-of-band event pushed
/// by the server (see [`Response::is_event`]).
#[derive(Debug, Clone)]
pub struct Response {
    code: u32,
    sync: Option<u64>,
    stream_id: Option<u64>,
    body: HashMap<u64, Value>,
}

impl Response {
    /// Decodes a frame payload (header map + body map, without the size
    /// prefix).
    pub fn decode(frame: &[u8]) -> WireResult<Self> {
        let mut cur = frame;
        let header = rmpv::decode::read_value(&mut cur)
            .map_err(|e| WireError::Decode(e.to_string()))?;
        let Value::Map(entries) = header else {
            return Err(WireError::Malformed("header is not a map".into()));
        };

        let mut code = None;
        let mut sync = None;
        let mut stream_id = None;
        for (key, value) in &entries {
            match key.as_u64() {
                Some(k) if k == header_key::REQUEST_TYPE as u64 => {
                    code = value.as_u64().map(|v| v as u32);
                }
                Some(k) if k == header_key::SYNC as u64 => sync = value.as_u64(),
                Some(k) if k == header_key::STREAM_ID as u64 => stream_id = value.as_u64(),
                _ => {}
            }
        }
        let code = code.ok_or_else(|| WireError::Malformed("header has no request type".into()))?;

        let mut body = HashMap::new();
        if !cur.is_empty() {
            let map = rmpv::decode::read_value(&mut cur)
                .map_err(|e| WireError::Decode(e.to_string()))?;
            let Value::Map(entries) = map else {
                return Err(WireError::Malformed("body is not a map".into()));
            };
            for (key, value) in entries {
                if let Some(k) = key.as_u64() {
                    body.insert(k, value);
                }
            }
        }

        Ok(Response {
            code,
            sync,
            stream_id,
            body,
        })
    }

    /// Raw response code from the header.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Correlation id, absent on pushed events.
    pub fn sync(&self) -> Option<u64> {
        self.sync
    }

    /// Stream id, present only when the request was bound to a stream.
    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    /// Whether the error flag is set on the response code.
    pub fn is_error(&self) -> bool {
        self.code & ERROR_TYPE_FLAG != 0
    }

    /// Server error code (low 15 bits) when the error flag is set.
    pub fn error_code(&self) -> Option<u32> {
        self.is_error().then_some(self.code & !ERROR_TYPE_FLAG)
    }

    /// Whether this frame is an out-of-band pushed event.
    pub fn is_event(&self) -> bool {
        self.sync.is_none()
    }

    fn field(&self, key: u8) -> Option<&Value> {
        self.body.get(&(key as u64))
    }

    /// Result rows / payload.
    pub fn data(&self) -> Option<&Value> {
        self.field(response_key::DATA)
    }

    /// Legacy error message string.
    pub fn error_message(&self) -> Option<&str> {
        self.field(response_key::ERROR_24).and_then(Value::as_str)
    }

    /// Extended error payload.
    pub fn error(&self) -> Option<&Value> {
        self.field(response_key::ERROR)
    }

    /// Continuation position returned when `fetch_position` was requested.
    pub fn position(&self) -> Option<&Value> {
        self.field(response_key::POSITION)
    }

    /// Tuple format metadata.
    pub fn tuple_formats(&self) -> Option<&Value> {
        self.field(response_key::TUPLE_FORMATS)
    }

    /// Event key of a pushed watch event.
    pub fn event_key(&self) -> Option<&str> {
        self.field(response_key::EVENT_KEY).and_then(Value::as_str)
    }

    /// Event payload of a pushed watch event.
    pub fn event_data(&self) -> Option<&Value> {
        self.field(response_key::EVENT_DATA)
    }
}
