//! NIP-01 subscription filters.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::{Event, is_hex_id};
use crate::tag_parsing::tag_values;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid tag filter key {0:?}: expected '#' followed by one ASCII letter")]
    InvalidTagKey(String),

    #[error("since ({since}) is after until ({until})")]
    InvalidTimeRange { since: u64, until: u64 },

    #[error("invalid id {0:?}: expected 64 lowercase hex characters")]
    InvalidId(String),

    #[error("invalid author {0:?}: expected 64 lowercase hex characters")]
    InvalidAuthor(String),
}

/// A NIP-01 filter.
///
/// Set-valued fields are sorted so two equal filters serialize identically.
/// An empty set (as opposed to an absent one) matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,
    /// Generic tag conditions keyed as `#e`, `#p`, ...
    #[serde(flatten)]
    pub tags: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .insert(author.into());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Require a tag named `letter` with the given value.
    pub fn tag(self, letter: char, value: impl Into<String>) -> Self {
        self.tag_values(letter, [value])
    }

    pub fn tag_values<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{letter}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Events referencing `id` through an `e` tag.
    pub fn event(self, id: impl Into<String>) -> Self {
        self.tag('e', id)
    }

    /// Events referencing `pubkey` through a `p` tag.
    pub fn pubkey(self, pubkey: impl Into<String>) -> Self {
        self.tag('p', pubkey)
    }

    /// Addressable events with this `d` tag.
    pub fn identifier(self, identifier: impl Into<String>) -> Self {
        self.tag('d', identifier)
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Tag conditions as `(letter, values)` pairs.
    pub fn tag_conditions(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.tags
            .iter()
            .map(|(key, values)| (key.strip_prefix('#').unwrap_or(key), values))
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        for key in self.tags.keys() {
            let mut chars = key.chars();
            let valid = chars.next() == Some('#')
                && chars.next().is_some_and(|letter| letter.is_ascii_alphabetic())
                && chars.next().is_none();
            if !valid {
                return Err(FilterError::InvalidTagKey(key.clone()));
            }
        }

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(FilterError::InvalidTimeRange { since, until });
            }
        }

        if let Some(id) = self.ids.iter().flatten().find(|id| !is_hex_id(id)) {
            return Err(FilterError::InvalidId(id.clone()));
        }
        if let Some(author) = self.authors.iter().flatten().find(|author| !is_hex_id(author)) {
            return Err(FilterError::InvalidAuthor(author.clone()));
        }

        Ok(())
    }

    /// Whether `event` satisfies every condition. `limit` is not considered.
    pub fn matches(&self, event: &Event) -> bool {
        if self.ids.as_ref().is_some_and(|ids| !ids.contains(&event.id)) {
            return false;
        }
        if self
            .authors
            .as_ref()
            .is_some_and(|authors| !authors.contains(&event.pubkey))
        {
            return false;
        }
        if self
            .kinds
            .as_ref()
            .is_some_and(|kinds| !kinds.contains(&event.kind))
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tag_conditions().all(|(letter, values)| {
            tag_values(&event.tags, letter).any(|value| values.contains(value))
        })
    }
}

/// Canonical key for a set of filters; equal filter sets share one signature
/// regardless of order or repetition.
pub fn filters_signature(filters: &[Filter]) -> String {
    let mut parts: Vec<String> = filters
        .iter()
        .map(|filter| serde_json::to_string(filter).unwrap_or_default())
        .collect();
    parts.sort_unstable();
    parts.dedup();
    format!("[{}]", parts.join(","))
}
