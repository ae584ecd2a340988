//! External service clients/adapters.
//!
//! The mail provider and the rule engine are owned by other systems; this
//! module only defines the seams we call through, their HTTP adapters, and
//! scripted in-memory stand-ins for tests/dev.

pub mod http;
pub mod ignore;
pub mod in_memory;
pub mod mail;
pub mod rules;

pub use http::{HttpMailProvider, HttpRuleEngine};
pub use ignore::IgnoreList;
pub use in_memory::{InMemoryMailProvider, InMemoryRuleEngine};
pub use mail::{MailError, MailProvider, Message, MessagePage, MessageQuery, MessageSummary};
pub use rules::{RuleEngine, RuleError, RuleOutcome};
