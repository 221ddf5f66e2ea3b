//! Engine event definitions
//!
//! One record of the engine's event stream (`/events`) describes something
//! that happened to a container, pod, image, or volume. Records are tolerant
//! JSON: unknown fields are ignored and missing ones default, since the
//! engine grows new event attributes between versions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// The object an event is about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Free-form attributes; containers carry `name` and `image` here.
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// One entry from the engine's event stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineEvent {
    /// Object class the event refers to (`container`, `pod`, `image`, ...).
    #[serde(rename = "Type", default)]
    pub kind: String,
    /// What happened (`create`, `start`, `died`, `remove`, `pull`, ...).
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    /// Event time in seconds since the epoch.
    #[serde(default)]
    pub time: Option<i64>,
    /// Event time in nanoseconds since the epoch, when the engine provides it.
    #[serde(rename = "timeNano", default)]
    pub time_nano: Option<i64>,
}

impl EngineEvent {
    /// Decode one streamed record into a typed event.
    ///
    /// Tolerates unknown fields; fails only when the record is not an object
    /// at all, which indicates a broken stream rather than a new engine
    /// version.
    pub fn from_value(record: Value) -> Result<Self> {
        Ok(serde_json::from_value(record)?)
    }

    /// Id of the object the event is about.
    pub fn id(&self) -> &str {
        &self.actor.id
    }

    /// The object's name, when the engine attached one.
    pub fn name(&self) -> Option<&str> {
        self.actor.attributes.get("name").map(String::as_str)
    }

    /// Event time as a timestamp, preferring nanosecond precision.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match (self.time_nano, self.time) {
            (Some(nanos), _) => Some(DateTime::from_timestamp_nanos(nanos)),
            (None, Some(secs)) => DateTime::from_timestamp(secs, 0),
            (None, None) => None,
        }
    }
}
