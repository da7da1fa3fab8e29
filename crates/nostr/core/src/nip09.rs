//! NIP-09: event deletion requests.
//!
//! A deletion request is a regular kind-5 event listing `e` ids and `a`
//! coordinates. Only the author of an event may delete it.

use thiserror::Error;

use crate::nip01::{Coordinate, Event, is_hex_id};
use crate::tag_parsing::{collect_tag_values, tag_values};

pub const DELETION_REQUEST_KIND: u16 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Nip09Error {
    #[error("expected deletion request kind 5, got {0}")]
    WrongKind(u16),

    #[error("invalid event id in deletion request: {0}")]
    InvalidEventId(String),

    #[error("invalid coordinate in deletion request: {0}")]
    InvalidCoordinate(String),

    #[error("{author} cannot delete {target} owned by another pubkey")]
    CrossAuthor { author: String, target: String },
}

/// Targets of a validated deletion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRequest {
    pub pubkey: String,
    pub created_at: u64,
    pub ids: Vec<String>,
    pub coordinates: Vec<Coordinate>,
    pub reason: String,
}

impl DeletionRequest {
    pub fn from_event(event: &Event) -> Result<Self, Nip09Error> {
        if event.kind != DELETION_REQUEST_KIND {
            return Err(Nip09Error::WrongKind(event.kind));
        }

        let ids = collect_tag_values(&event.tags, "e");
        if let Some(id) = ids.iter().find(|id| !is_hex_id(id)) {
            return Err(Nip09Error::InvalidEventId(id.clone()));
        }

        let mut coordinates = Vec::new();
        for value in tag_values(&event.tags, "a") {
            let coordinate: Coordinate = value
                .parse()
                .map_err(|_| Nip09Error::InvalidCoordinate(value.to_string()))?;
            if coordinate.pubkey != event.pubkey {
                return Err(Nip09Error::CrossAuthor {
                    author: event.pubkey.clone(),
                    target: value.to_string(),
                });
            }
            coordinates.push(coordinate);
        }

        Ok(Self {
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            ids,
            coordinates,
            reason: event.content.clone(),
        })
    }

    /// Whether this request may delete `target`.
    pub fn authorizes(&self, target: &Event) -> bool {
        target.pubkey == self.pubkey
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deletion(pubkey: &str, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "d".repeat(64),
            pubkey: pubkey.to_string(),
            created_at: 50,
            kind: DELETION_REQUEST_KIND,
            tags,
            content: "spam".to_string(),
            sig: String::new(),
        }
    }

    fn tag(name: &str, value: String) -> Vec<String> {
        vec![name.to_string(), value]
    }

    #[test]
    fn extracts_ids_and_coordinates() {
        let author = "a".repeat(64);
        let event = deletion(
            &author,
            vec![
                tag("e", "1".repeat(64)),
                tag("a", format!("30023:{author}:post")),
                tag("p", "b".repeat(64)),
            ],
        );

        let request = DeletionRequest::from_event(&event).unwrap();
        assert_eq!(request.ids, vec!["1".repeat(64)]);
        assert_eq!(
            request.coordinates,
            vec![Coordinate::new(30_023, author.clone(), "post")]
        );
        assert_eq!(request.created_at, 50);
        assert_eq!(request.reason, "spam");
    }

    #[test]
    fn rejects_cross_author_coordinates() {
        let author = "a".repeat(64);
        let other = "b".repeat(64);
        let event = deletion(&author, vec![tag("a", format!("0:{other}:"))]);

        assert!(matches!(
            DeletionRequest::from_event(&event),
            Err(Nip09Error::CrossAuthor { .. })
        ));
    }

    #[test]
    fn rejects_malformed_targets_and_kind() {
        let author = "a".repeat(64);
        assert!(matches!(
            DeletionRequest::from_event(&deletion(&author, vec![tag("e", "xyz".to_string())])),
            Err(Nip09Error::InvalidEventId(_))
        ));
        assert!(matches!(
            DeletionRequest::from_event(&deletion(&author, vec![tag("a", "nope".to_string())])),
            Err(Nip09Error::InvalidCoordinate(_))
        ));

        let mut note = deletion(&author, vec![]);
        note.kind = 1;
        assert_eq!(
            DeletionRequest::from_event(&note),
            Err(Nip09Error::WrongKind(1))
        );
    }
}
