//! `sweep-core`: identifiers and error primitives shared by every crate.
//!
//! Nothing in here touches I/O.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, MailboxId, MessageId, ThreadId, UserId};
