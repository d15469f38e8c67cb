//! Connect-time greeting banner.
//!
//! Before any framed traffic the server sends a fixed 128-byte text banner:
//! a 64-byte server identification line followed by a 64-byte line holding
//! the base64-encoded auth salt.

use base64::Engine;

use boxproto_wire::WireError;

use crate::auth::SCRAMBLE_SIZE;
use crate::error::ClientResult;

/// Total banner size in bytes.
pub const GREETING_SIZE: usize = 128;

const LINE_SIZE: usize = 64;

/// Parsed greeting banner.
#[derive(Debug, Clone)]
pub struct Greeting {
    /// Server identification line, trimmed.
    pub server: String,
    /// Decoded auth salt; at least [`SCRAMBLE_SIZE`] bytes.
    pub salt: Vec<u8>,
}

/// Parses the raw 128-byte banner. A banner that does not parse is
/// malformed protocol structure, fatal to the connect attempt.
pub fn parse_greeting(raw: &[u8; GREETING_SIZE]) -> ClientResult<Greeting> {
    let server = String::from_utf8_lossy(&raw[..LINE_SIZE]).trim().to_string();

    let salt_line = std::str::from_utf8(&raw[LINE_SIZE..])
        .map_err(|_| WireError::Malformed("greeting salt line is not ASCII".into()))?;
    let salt = base64::engine::general_purpose::STANDARD
        .decode(salt_line.trim())
        .map_err(|e| WireError::Malformed(format!("invalid greeting salt: {e}")))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(WireError::Malformed(format!(
            "greeting salt too short: {} bytes",
            salt.len()
        ))
        .into());
    }

    Ok(Greeting { server, salt })
}
