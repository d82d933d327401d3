//! Room events as stored by the room server.
//!
//! Events arrive already validated; this module only parses their canonical
//! JSON and derives the reference hash other events use to point at them.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Keys excluded from the reference hash.
const UNHASHED_KEYS: [&str; 2] = ["signatures", "unsigned"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("invalid event JSON: {0}")]
    Json(String),
    #[error("event JSON must be an object")]
    NotAnObject,
    #[error("event is missing a non-empty {0}")]
    MissingField(&'static str),
    #[error("invalid reference hash for prev event {0}")]
    InvalidReferenceHash(String),
}

/// Points at an event by id and the SHA-256 of its hashed content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventReference {
    pub event_id: String,
    pub event_sha256: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct EventFields {
    event_id: String,
    sender: String,
    room_id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    depth: i64,
    #[serde(default)]
    prev_events: Vec<(String, PrevEventHashes)>,
}

#[derive(Debug, Deserialize)]
struct PrevEventHashes {
    sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    event_id: String,
    sender: String,
    room_id: String,
    event_type: String,
    state_key: Option<String>,
    depth: i64,
    prev_events: Vec<EventReference>,
    reference_sha256: Vec<u8>,
    json: String,
}

impl Event {
    /// Parses an event and re-encodes it canonically (sorted keys, no
    /// insignificant whitespace).
    pub fn from_json(json: &[u8]) -> Result<Self, EventError> {
        let value: Value =
            serde_json::from_slice(json).map_err(|error| EventError::Json(error.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let Value::Object(object) = &value else {
            return Err(EventError::NotAnObject);
        };

        let mut hashed = object.clone();
        for key in UNHASHED_KEYS {
            hashed.remove(key);
        }
        let hashed_bytes = serde_json::to_vec(&hashed)
            .map_err(|error| EventError::Json(error.to_string()))?;
        let reference_sha256 = Sha256::digest(&hashed_bytes).to_vec();

        let json =
            serde_json::to_string(&value).map_err(|error| EventError::Json(error.to_string()))?;
        let fields: EventFields =
            serde_json::from_value(value).map_err(|error| EventError::Json(error.to_string()))?;

        if fields.event_id.is_empty() {
            return Err(EventError::MissingField("event_id"));
        }
        if fields.room_id.is_empty() {
            return Err(EventError::MissingField("room_id"));
        }
        if fields.event_type.is_empty() {
            return Err(EventError::MissingField("type"));
        }

        let prev_events = fields
            .prev_events
            .into_iter()
            .map(|(event_id, hashes)| {
                let event_sha256 = STANDARD_NO_PAD
                    .decode(hashes.sha256.trim_end_matches('='))
                    .map_err(|_| EventError::InvalidReferenceHash(event_id.clone()))?;
                Ok(EventReference {
                    event_id,
                    event_sha256,
                })
            })
            .collect::<Result<Vec<_>, EventError>>()?;

        Ok(Self {
            event_id: fields.event_id,
            sender: fields.sender,
            room_id: fields.room_id,
            event_type: fields.event_type,
            state_key: fields.state_key,
            depth: fields.depth,
            prev_events,
            reference_sha256,
            json,
        })
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// `None` for message events.
    #[must_use]
    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    #[must_use]
    pub fn depth(&self) -> i64 {
        self.depth
    }

    #[must_use]
    pub fn prev_events(&self) -> &[EventReference] {
        &self.prev_events
    }

    #[must_use]
    pub fn reference_sha256(&self) -> &[u8] {
        &self.reference_sha256
    }

    #[must_use]
    pub fn event_reference(&self) -> EventReference {
        EventReference {
            event_id: self.event_id.clone(),
            event_sha256: self.reference_sha256.clone(),
        }
    }

    /// Canonical JSON body.
    #[must_use]
    pub fn json(&self) -> &str {
        &self.json
    }
}

/// Encodes a reference hash the way `prev_events` entries carry it.
#[must_use]
pub fn encode_reference_hash(sha256: &[u8]) -> String {
    STANDARD_NO_PAD.encode(sha256)
}
