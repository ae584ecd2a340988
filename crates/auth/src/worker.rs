//! Worker endpoint authentication.
//!
//! Two modes are accepted:
//!
//! - **Signature**: the queue service signs every delivery with a short-lived
//!   HS256 JWT whose `body` claim is the base64url SHA-256 digest of the
//!   request body. Either the current or the next signing key may have
//!   produced it (key rotation).
//! - **Shared secret**: internal and fallback deliveries carry a static
//!   secret header.
//!
//! A request passes when any credential it presents verifies.

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use hmac::Mac;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

type HmacSha256 = hmac::Hmac<Sha256>;

/// Header carrying the queue-service delivery signature.
pub const SIGNATURE_HEADER: &str = "upstash-signature";
/// Header carrying the shared worker secret.
pub const SHARED_SECRET_HEADER: &str = "x-worker-secret";

/// Claims carried by a queue-service delivery signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSignatureClaims {
    pub iss: String,
    /// Destination URL the message was published to
    pub sub: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    /// base64url(sha256(body))
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeys {
    pub current: String,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAuthMode {
    Signature,
    SharedSecret,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerAuthError {
    #[error("no worker credentials presented")]
    MissingCredentials,

    #[error("invalid delivery signature: {0}")]
    InvalidSignature(String),

    #[error("delivery signature does not match request body")]
    BodyMismatch,

    #[error("invalid shared secret")]
    InvalidSecret,
}

/// What a worker request presented.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCredentials<'a> {
    pub signature: Option<&'a str>,
    pub shared_secret: Option<&'a str>,
    pub body: &'a [u8],
}

/// base64url (unpadded) SHA-256 of a request body.
pub fn body_digest(body: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

#[derive(Debug, Clone, Default)]
pub struct WorkerAuthenticator {
    signing: Option<SigningKeys>,
    shared_secret: Option<String>,
}

impl WorkerAuthenticator {
    pub fn new(signing: Option<SigningKeys>, shared_secret: Option<String>) -> Self {
        Self {
            signing,
            shared_secret: shared_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn verify(&self, credentials: WorkerCredentials<'_>) -> Result<WorkerAuthMode, WorkerAuthError> {
        let mut failure = None;

        if let (Some(signature), Some(keys)) = (credentials.signature, &self.signing) {
            match verify_signature(keys, signature, credentials.body) {
                Ok(()) => return Ok(WorkerAuthMode::Signature),
                Err(e) => {
                    debug!(error = %e, "delivery signature rejected");
                    failure = Some(e);
                }
            }
        }

        if let (Some(provided), Some(expected)) = (credentials.shared_secret, &self.shared_secret) {
            if secrets_match(expected, provided) {
                return Ok(WorkerAuthMode::SharedSecret);
            }
            failure.get_or_insert(WorkerAuthError::InvalidSecret);
        }

        Err(failure.unwrap_or(WorkerAuthError::MissingCredentials))
    }
}

fn verify_signature(keys: &SigningKeys, token: &str, body: &[u8]) -> Result<(), WorkerAuthError> {
    let claims = match decode_with(&keys.current, token) {
        Ok(claims) => claims,
        Err(first) => match &keys.next {
            Some(next) => {
                let claims = decode_with(next, token)?;
                debug!("delivery signed with the next signing key");
                claims
            }
            None => return Err(first),
        },
    };

    if claims.body.trim_end_matches('=') != body_digest(body) {
        return Err(WorkerAuthError::BodyMismatch);
    }
    Ok(())
}

fn decode_with(key: &str, token: &str) -> Result<QueueSignatureClaims, WorkerAuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    validation.validate_aud = false;
    jsonwebtoken::decode::<QueueSignatureClaims>(
        token,
        &DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| WorkerAuthError::InvalidSignature(e.to_string()))
}

/// Constant-time comparison: both sides are reduced to HMAC tags and compared
/// with `verify_slice`.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let tag = |key: &str| {
        HmacSha256::new_from_slice(key.as_bytes()).map(|mut mac| {
            mac.update(b"sweep-worker");
            mac
        })
    };
    let (Ok(expected), Ok(provided)) = (tag(expected), tag(provided)) else {
        return false;
    };
    expected
        .verify_slice(&provided.finalize().into_bytes())
        .is_ok()
}
