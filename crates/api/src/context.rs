use sweep_auth::JwtClaims;
use sweep_core::{MailboxId, UserId};

/// Caller context for a request (authenticated user + owned mailboxes).
///
/// Inserted by the auth middleware; present on every `/bulk/jobs` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    user_id: UserId,
    mailboxes: Vec<MailboxId>,
}

impl CallerContext {
    pub fn new(user_id: UserId, mailboxes: Vec<MailboxId>) -> Self {
        Self { user_id, mailboxes }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn mailboxes(&self) -> &[MailboxId] {
        &self.mailboxes
    }

    pub fn owns(&self, mailbox_id: MailboxId) -> bool {
        self.mailboxes.contains(&mailbox_id)
    }
}

impl From<JwtClaims> for CallerContext {
    fn from(claims: JwtClaims) -> Self {
        Self::new(claims.sub, claims.mailboxes)
    }
}
