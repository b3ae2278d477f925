//! Challenge/response password scramble for transport setup.
//!
//! The server stores SHA1(SHA1(password)) and issues a nonce in its
//! greeting; the client proves knowledge of the password without sending it:
//!
//! ```text
//! response = SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
//! ```

use sha1::{Digest, Sha1};

/// Length of the greeting nonce.
pub const NONCE_LEN: usize = 20;

/// SHA1 over the concatenation of `parts`.
fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor(a: &[u8], b: [u8; 20]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Compute the auth response for the greeting nonce. An empty password
/// sends an empty response.
pub fn compute_auth_response(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = sha1(&[password.as_bytes()]);
    xor(&stage1, sha1(&[nonce, &sha1(&[&stage1])]))
}

/// SHA1(SHA1(password)), the server-stored verifier.
pub fn password_verifier(password: &str) -> Vec<u8> {
    sha1(&[&sha1(&[password.as_bytes()])]).to_vec()
}

/// Server-side check used by test fixtures: recover stage1 from the response
/// and verify it hashes to the stored verifier.
pub fn verify_auth_response(verifier: &[u8], nonce: &[u8], response: &[u8]) -> bool {
    if response.len() != 20 {
        return false;
    }
    let stage1 = xor(response, sha1(&[nonce, verifier]));
    sha1(&[&stage1]).as_slice() == verifier
}
