//! NIP-40: expiration timestamp.

use crate::nip01::Event;
use crate::tag_parsing::parse_tag_value;

pub const EXPIRATION_TAG: &str = "expiration";

/// Unix timestamp after which `event` should no longer be served.
pub fn expiration(event: &Event) -> Option<u64> {
    parse_tag_value(&event.tags, EXPIRATION_TAG)
}

/// An event is expired once `now` reaches its expiration timestamp.
pub fn is_expired(event: &Event, now: u64) -> bool {
    expiration(event).is_some_and(|expires_at| expires_at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tags: Vec<Vec<String>>) -> Event {
        Event {
            id: String::new(),
            pubkey: String::new(),
            created_at: 0,
            kind: 1,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn reads_expiration_tag() {
        let expiring = event(vec![vec!["expiration".to_string(), "100".to_string()]]);
        assert_eq!(expiration(&expiring), Some(100));
        assert!(!is_expired(&expiring, 99));
        assert!(is_expired(&expiring, 100));
        assert!(is_expired(&expiring, 101));
    }

    #[test]
    fn ignores_missing_or_malformed_tag() {
        assert_eq!(expiration(&event(vec![])), None);
        let malformed = event(vec![vec!["expiration".to_string(), "soon".to_string()]]);
        assert_eq!(expiration(&malformed), None);
        assert!(!is_expired(&malformed, u64::MAX));
    }
}
