//! Verify token generation.

use crate::types::Mode;
use rand::RngCore;

/// Random bytes per token (hex-encoded after the mode prefix).
const TOKEN_ENTROPY_BYTES: usize = 20;

/// Generate a fresh verify token for a handshake in `mode`.
///
/// The token is the mode string followed by 40 hex characters drawn from
/// the thread-local CSPRNG.
pub fn generate_token(mode: Mode) -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut token = String::with_capacity(mode.as_str().len() + TOKEN_ENTROPY_BYTES * 2);
    token.push_str(mode.as_str());
    token.push_str(&hex::encode(bytes));
    token
}
