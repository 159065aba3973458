//! Stable IMAP message identifier parsing and encoding
//!
//! IMAP messages are addressed by mailbox, UIDVALIDITY and UID. These are
//! packed into one opaque string so that list/search results can be fed back
//! into detail and archive tools. Mailbox names may contain colons.

use crate::errors::{AppError, AppResult};

/// Stable IMAP message identifier
///
/// # Format
///
/// `imap:{mailbox}:{uidvalidity}:{uid}`, e.g. `imap:INBOX:12345:42` or
/// `imap:Projects:2026:Q1:999:7` (mailbox `Projects:2026:Q1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    /// Mailbox name (may contain colons)
    pub mailbox: String,
    /// IMAP UIDVALIDITY (mailbox snapshot identifier)
    pub uidvalidity: u32,
    /// Message UID within mailbox
    pub uid: u32,
}

impl MessageId {
    /// Parse a message ID string
    ///
    /// UID and UIDVALIDITY are taken from the end so that colons inside the
    /// mailbox name survive.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let rest = raw
            .strip_prefix("imap:")
            .ok_or_else(|| AppError::invalid("message_id must start with 'imap:'"))?;

        let (rest, uid) = rest
            .rsplit_once(':')
            .ok_or_else(|| AppError::invalid("message_id is missing the uid segment"))?;
        let uid = uid
            .parse::<u32>()
            .map_err(|_| AppError::invalid("invalid uid in message_id"))?;

        let (mailbox, uidvalidity) = rest
            .rsplit_once(':')
            .ok_or_else(|| AppError::invalid("message_id is missing the uidvalidity segment"))?;
        let uidvalidity = uidvalidity
            .parse::<u32>()
            .map_err(|_| AppError::invalid("invalid uidvalidity in message_id"))?;

        if mailbox.is_empty() {
            return Err(AppError::invalid("message_id mailbox cannot be empty"));
        }

        Ok(Self {
            mailbox: mailbox.to_owned(),
            uidvalidity,
            uid,
        })
    }

    pub fn encode(&self) -> String {
        format!("imap:{}:{}:{}", self.mailbox, self.uidvalidity, self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::MessageId;

    #[test]
    fn parses_and_encodes_standard_message_id() {
        let id = MessageId::parse("imap:INBOX:123:42").expect("parse succeeds");
        assert_eq!(id.mailbox, "INBOX");
        assert_eq!(id.uidvalidity, 123);
        assert_eq!(id.uid, 42);
        assert_eq!(id.encode(), "imap:INBOX:123:42");
    }

    #[test]
    fn parses_mailbox_with_colons() {
        let id = MessageId::parse("imap:Projects:2026:Q1:999:7").expect("parse succeeds");
        assert_eq!(id.mailbox, "Projects:2026:Q1");
        assert_eq!(id.uidvalidity, 999);
        assert_eq!(id.uid, 7);
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in ["gmail:INBOX:1:2", "imap:INBOX:1", "imap::1:2", "imap:INBOX:x:2", "18c2f"] {
            assert!(MessageId::parse(raw).is_err(), "{raw} must be rejected");
        }
    }
}
