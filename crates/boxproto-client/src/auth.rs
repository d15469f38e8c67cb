//! Authentication handshake material.
//!
//! The server's greeting carries a random salt; the client answers with an
//! `Auth` request whose token depends on the chosen algorithm. A server
//! error at this stage is fatal to the connect attempt and leaves no
//! partial-auth state behind.

use sha1::{Digest, Sha1};

use boxproto_wire::Request;

/// Scramble length, and the number of salt bytes that feed it.
pub const SCRAMBLE_SIZE: usize = 20;

/// Supported auth algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// Challenge/response over SHA-1; the password never travels.
    #[default]
    ChapSha1,
    /// Cleartext password. Safe only over an encrypted channel.
    PapSha256,
}

impl AuthMethod {
    /// Protocol name of the algorithm.
    pub fn name(self) -> &'static str {
        match self {
            AuthMethod::ChapSha1 => "chap-sha1",
            AuthMethod::PapSha256 => "pap-sha256",
        }
    }
}

/// Computes the CHAP-SHA1 scramble.
///
/// `step1 = SHA1(password)`, `step2 = SHA1(step1)`,
/// `h = SHA1(salt[0..20] ++ step2)`, `scramble[i] = h[i] ^ step1[i]`.
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE]);
    hasher.update(step2);
    let h = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = h[i] ^ step1[i];
    }
    out
}

/// Builds the `Auth` request for the configured algorithm.
pub fn auth_request(user: &str, password: &str, method: AuthMethod, salt: &[u8]) -> Request {
    let token = match method {
        AuthMethod::ChapSha1 => scramble(salt, password).to_vec(),
        AuthMethod::PapSha256 => password.as_bytes().to_vec(),
    };
    Request::Auth {
        user: user.to_string(),
        method: method.name().to_string(),
        token,
    }
}
