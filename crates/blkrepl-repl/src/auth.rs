//! Challenge/response peer authentication with a shared secret.
//!
//! Both sides send a random challenge, answer the peer's challenge with
//! `HMAC-SHA256(secret, challenge)` and check the peer's answer to their own.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info};

use crate::conduit::Conduit;
use crate::config::SharedSecret;
use crate::error::{ReplError, ReplResult};
use crate::protocol::{Channel, Packet, MAX_CHALLENGE_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Length of the challenge we send.
pub const CHALLENGE_LEN: usize = 64;
/// Length of an HMAC-SHA256 response.
pub const RESPONSE_LEN: usize = 32;

fn auth_err(msg: impl Into<String>) -> ReplError {
    ReplError::Auth { msg: msg.into() }
}

/// A fresh random challenge.
pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut c = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut c);
    c
}

/// Our answer to `challenge`.
pub fn compute_response(secret: &SharedSecret, challenge: &[u8]) -> ReplResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| auth_err(format!("setting HMAC key failed: {e}")))?;
    mac.update(challenge);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Whether `response` answers our `challenge` correctly.
pub fn verify_response(secret: &SharedSecret, challenge: &[u8], response: &[u8]) -> ReplResult<bool> {
    if response.len() != RESPONSE_LEN {
        return Ok(false);
    }
    let expected = compute_response(secret, challenge)?;
    Ok(bool::from(expected.as_slice().ct_eq(response)))
}

/// Run the exchange over the data channel of `link`.
///
/// `alg` is only used for the log line; the digest is always SHA-256.
pub async fn authenticate(link: &Conduit, secret: &SharedSecret, alg: &str) -> ReplResult<()> {
    let my_challenge = new_challenge();
    link.send(&Packet::AuthChallenge(Bytes::copy_from_slice(&my_challenge)))?;

    let peer_challenge = match link.recv(Channel::Data).await? {
        Packet::AuthChallenge(c) => c,
        other => {
            error!(cmd = other.command(), "expected AuthChallenge packet");
            return Err(auth_err(format!(
                "expected AuthChallenge packet, received: {:#x}",
                other.command()
            )));
        }
    };
    if peer_challenge.len() > MAX_CHALLENGE_LEN {
        error!(len = peer_challenge.len(), "AuthChallenge payload too big.");
        return Err(auth_err("AuthChallenge payload too big"));
    }

    let response = compute_response(secret, &peer_challenge)?;
    link.send(&Packet::AuthResponse(Bytes::from(response)))?;

    let peer_response = match link.recv(Channel::Data).await? {
        Packet::AuthResponse(r) => r,
        other => {
            error!(cmd = other.command(), "expected AuthResponse packet");
            return Err(auth_err(format!(
                "expected AuthResponse packet, received: {:#x}",
                other.command()
            )));
        }
    };
    if peer_response.len() != RESPONSE_LEN {
        error!(len = peer_response.len(), "AuthResponse payload of wrong size");
        return Err(auth_err("AuthResponse payload of wrong size"));
    }

    if !verify_response(secret, &my_challenge, &peer_response)? {
        error!("Peer presented the wrong shared secret");
        return Err(auth_err("wrong shared secret"));
    }
    info!("Peer authenticated using {RESPONSE_LEN} bytes of '{alg}' HMAC");
    Ok(())
}
