//! Core domain model for the event aggregator: scrape sources, extracted
//! candidates and stored events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "eventhive-core";

/// A configured third-party listing site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub logo: Option<String>,
    pub is_enabled: bool,
    #[serde(default)]
    pub last_scraped: Option<DateTime<Utc>>,
}

impl Source {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            logo: None,
            is_enabled: true,
            last_scraped: None,
        }
    }

    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = Some(logo.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

/// Listing section a card was found in, for sources that split their pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Ongoing,
    Upcoming,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Ongoing => "Ongoing",
            EventStatus::Upcoming => "Upcoming",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Ongoing" => Some(EventStatus::Ongoing),
            "Upcoming" => Some(EventStatus::Upcoming),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event record produced by an extractor, not yet checked against the store.
///
/// `date` and `registration_deadline` are free-form: sources publish anything
/// from ISO timestamps to "TBD".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCandidate {
    pub title: String,
    pub organizer: String,
    pub date: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub registration_deadline: Option<String>,
    #[serde(default)]
    pub registration_url: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub eligibility: Option<String>,
    #[serde(default)]
    pub prizes: Option<String>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
}

impl EventCandidate {
    /// Minimal candidate; every optional field left empty.
    pub fn new(
        title: impl Into<String>,
        organizer: impl Into<String>,
        date: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            organizer: organizer.into(),
            date: date.into(),
            location: None,
            event_type: None,
            image_url: None,
            is_virtual: false,
            description: None,
            registration_deadline: None,
            registration_url: None,
            skills: Vec::new(),
            eligibility: None,
            prizes: None,
            source: source.into(),
            status: None,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.title, &self.source)
    }
}

/// Identity used by the merge step: an event is "already known" when a stored
/// event has exactly the same title and source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub title: String,
    pub source: String,
}

impl DedupKey {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.title)
    }
}

/// Persisted event. The crawl pipeline only ever creates these; edits belong
/// to the CRUD API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: Uuid,
    #[serde(flatten)]
    pub event: EventCandidate,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub is_featured: bool,
}

impl StoredEvent {
    pub fn from_candidate(event: EventCandidate, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            created_at,
            created_by: None,
            is_featured: false,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.event.dedup_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_serializes_with_original_field_names() {
        let mut candidate = EventCandidate::new("AI Hack", "Major League Hacking", "Upcoming", "MLH");
        candidate.event_type = Some("Hackathon".into());
        candidate.is_virtual = true;
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["type"], "Hackathon");
        assert_eq!(json["isVirtual"], true);
        assert!(json.get("status").is_none());
    }

    #[test]
    fn stored_event_flattens_candidate_fields() {
        let candidate = EventCandidate::new("X", "Devfolio", "TBD", "Devfolio");
        let stored = StoredEvent::from_candidate(candidate, Utc::now());
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["title"], "X");
        assert_eq!(json["isFeatured"], false);
        assert_eq!(stored.dedup_key(), DedupKey::new("X", "Devfolio"));
    }

    #[test]
    fn status_round_trips_through_its_label() {
        for status in [EventStatus::Ongoing, EventStatus::Upcoming] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("Closed"), None);
    }
}
