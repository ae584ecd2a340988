//! `sweep-auth`: authentication boundary.
//!
//! Two kinds of callers reach the service: end users holding a bearer JWT,
//! and dispatch backends invoking the worker endpoint. Both are verified
//! here, decoupled from HTTP and storage.

pub mod claims;
pub mod jwt;
pub mod worker;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtError, JwtValidator};
pub use worker::{
    QueueSignatureClaims, SHARED_SECRET_HEADER, SIGNATURE_HEADER, SigningKeys, WorkerAuthError, WorkerAuthMode, WorkerAuthenticator,
    WorkerCredentials, body_digest,
};
