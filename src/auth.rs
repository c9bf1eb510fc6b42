//! Bearer credential verification.
//!
//! Login and token issuance belong to the account service; this side only
//! needs `current_user(credential) → user id`. Credentials are compact
//! MAC-signed tokens: `base64url(payload) "." base64url(mac)` where the
//! payload is `{"sub": user_id, "exp": unix_seconds}` and the MAC is a
//! BLAKE3 keyed hash under a key derived from the shared signing secret.
//! Verification is constant-time on the MAC.
//!
//! [`TokenVerifier::mint`] exists for the issuing collaborator and for
//! tests; the service itself never mints in request paths.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::types::UserId;
use crate::{Error, Result};

/// Domain-separation string for key derivation.
const KEY_CONTEXT: &str = "tabula 2025 bearer token v1";

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

/// Verifies (and, for the issuer, signs) bearer credentials.
#[derive(Clone)]
pub struct TokenVerifier {
    key: [u8; 32],
    ttl: Duration,
}

impl TokenVerifier {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        TokenVerifier {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
            ttl,
        }
    }

    /// Issue a credential for `user_id`, valid for the configured lifetime.
    pub fn mint(&self, user_id: &str) -> Result<String> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::other(e.to_string()))?
            .as_secs()
            + self.ttl.as_secs();
        let payload = serde_json::to_vec(&Claims { sub: user_id.to_string(), exp })?;
        let mac = blake3::keyed_hash(&self.key, &payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac.as_bytes())
        ))
    }

    /// Resolve a credential to its user id, or fail with `Unauthorized`.
    pub fn current_user(&self, credential: &str) -> Result<UserId> {
        let (payload_b64, mac_b64) = credential
            .split_once('.')
            .ok_or_else(|| Error::unauthorized("malformed credential"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| Error::unauthorized("malformed credential"))?;
        let presented_mac: [u8; 32] = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| Error::unauthorized("malformed credential"))?
            .try_into()
            .map_err(|_| Error::unauthorized("malformed credential"))?;

        let expected = blake3::keyed_hash(&self.key, &payload);
        if expected.as_bytes().ct_eq(&presented_mac).unwrap_u8() != 1 {
            return Err(Error::unauthorized("signature mismatch"));
        }

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| Error::unauthorized("bad payload"))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::other(e.to_string()))?
            .as_secs();
        if claims.exp <= now {
            return Err(Error::unauthorized("credential expired"));
        }

        Ok(claims.sub)
    }
}
