//! Signed session tokens and the per-device session table.
//!
//! A token is `base64url(payload) "." base64url(HMAC-SHA256(payload, secret))`
//! where the payload is a compact JSON claims object. Signature comparison is
//! constant time; the payload is only trusted after the signature checks out.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use protocol::consts::SESSION_TTL_MS;

type HmacSha256 = Hmac<Sha256>;

/// The signed claims. Field names are part of the persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Persistent device id.
    pub pid: String,
    /// Display name at issue time.
    pub name: String,
    /// Absolute expiry, epoch milliseconds.
    pub exp: u64,
    /// Random value so two tokens for the same device never collide.
    pub nonce: String,
    /// Linked profile id, when the device has one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uid: Option<String>,
    /// Friend code of the linked profile.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fc: Option<String>,
    /// Username of the linked account.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub un: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not two base64url parts")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

fn sign(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    // The key size of HMAC-SHA256 accepts any secret length.
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Serializes and signs the claims.
pub fn mint_token(secret: &[u8], claims: &TokenClaims) -> String {
    let payload = serde_json::to_vec(claims).expect("claims serialize");
    let signature = sign(secret, &payload);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(&signature)
    )
}

/// Checks shape, signature and expiry, in that order.
pub fn verify_token(secret: &[u8], token: &str, now_ms: u64) -> Result<TokenClaims, TokenError> {
    let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Malformed)?;

    let expected = sign(secret, &payload);
    if signature.ct_eq(&expected).unwrap_u8() != 1 {
        return Err(TokenError::BadSignature);
    }

    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
    if claims.exp <= now_ms {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

/// What the server remembers about an identified device.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub name: String,
    pub expires_at: u64,
    pub profile_id: Option<String>,
    pub friend_code: Option<String>,
    pub username: Option<String>,
    pub guest: bool,
}

/// Sessions keyed by persistent device id. Written on the socket-event path
/// only; readers tolerate momentarily stale values.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    /// Issues a fresh token for the device and stores the session.
    pub fn issue(
        &self,
        secret: &[u8],
        persistent_id: &str,
        name: &str,
        profile: Option<(&str, &str, Option<&str>)>,
        guest: bool,
        now_ms: u64,
    ) -> Session {
        let nonce = format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>());
        let expires_at = now_ms + SESSION_TTL_MS;
        let claims = TokenClaims {
            pid: persistent_id.to_string(),
            name: name.to_string(),
            exp: expires_at,
            nonce,
            uid: profile.map(|(id, _, _)| id.to_string()),
            fc: profile.map(|(_, fc, _)| fc.to_string()),
            un: profile.and_then(|(_, _, un)| un.map(str::to_string)),
        };
        let session = Session {
            token: mint_token(secret, &claims),
            name: name.to_string(),
            expires_at,
            profile_id: claims.uid.clone(),
            friend_code: claims.fc.clone(),
            username: claims.un.clone(),
            guest,
        };
        self.sessions.insert(persistent_id.to_string(), session.clone());
        session
    }

    pub fn get(&self, persistent_id: &str) -> Option<Session> {
        self.sessions.get(persistent_id).map(|s| s.clone())
    }

    /// Rewrites the stored display name, leaving the token alone; the next
    /// issue picks the new name up.
    pub fn set_name(&self, persistent_id: &str, name: &str) {
        if let Some(mut session) = self.sessions.get_mut(persistent_id) {
            session.name = name.to_string();
        }
    }

    /// Drops sessions whose token has expired.
    pub fn prune(&self, now_ms: u64) {
        self.sessions.retain(|_, s| s.expires_at > now_ms);
    }
}
