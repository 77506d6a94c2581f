//! Class change event exchanged between publisher and consumer.
//!
//! The wire form is a JSON document with camelCase field names. Older
//! producers used `classId`/`className`, which are still accepted on read.

use std::fmt;

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Wire format of `timestamp`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Mutation kind carried by an event.
///
/// Producers only emit the three known kinds. Consumers may still see
/// other strings on the wire; those arrive as `Unknown` and are accepted
/// with a warning rather than dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
    Unknown(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        match value {
            "CREATE" => Action::Create,
            "UPDATE" => Action::Update,
            "DELETE" => Action::Delete,
            other => Action::Unknown(other.to_string()),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Action::from(raw.as_str()))
    }
}

/// Outcome known at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Success,
    Failed,
}

/// Synthetic failure directives used to exercise the dead-letter path.
///
/// The serialized names are the marker strings older producers embedded in
/// free-form fields, so the legacy scan and the explicit field agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestDirective {
    #[serde(rename = "TEST_FAILURE_TRIGGER")]
    FailProcessing,
    #[serde(rename = "POISON_MESSAGE_TEST")]
    PoisonMessage,
    #[serde(rename = "THROW_RUNTIME_EXCEPTION")]
    RuntimeFault,
    #[serde(rename = "BATCH_FAILURE_TRIGGER")]
    BatchFailure,
    #[serde(rename = "TRIGGER_CONSUMER_FAILURE")]
    ConsumerFailure,
}

impl TestDirective {
    pub const ALL: [TestDirective; 5] = [
        TestDirective::FailProcessing,
        TestDirective::PoisonMessage,
        TestDirective::RuntimeFault,
        TestDirective::BatchFailure,
        TestDirective::ConsumerFailure,
    ];

    /// Marker string as it appears on the wire.
    pub fn marker(self) -> &'static str {
        match self {
            TestDirective::FailProcessing => "TEST_FAILURE_TRIGGER",
            TestDirective::PoisonMessage => "POISON_MESSAGE_TEST",
            TestDirective::RuntimeFault => "THROW_RUNTIME_EXCEPTION",
            TestDirective::BatchFailure => "BATCH_FAILURE_TRIGGER",
            TestDirective::ConsumerFailure => "TRIGGER_CONSUMER_FAILURE",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.marker() == marker)
    }
}

impl fmt::Display for TestDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Domain-change notification for a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(alias = "classId")]
    pub entity_id: Option<i64>,
    #[serde(default, alias = "className")]
    pub entity_name: Option<String>,
    pub action: Action,
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(with = "timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<TestDirective>,
}

impl Event {
    fn new(
        entity_id: Option<i64>,
        entity_name: Option<&str>,
        action: Action,
        status: Status,
        message: Option<&str>,
    ) -> Self {
        Self {
            event_id: Some(Uuid::new_v4()),
            entity_id,
            entity_name: entity_name.map(str::to_string),
            action,
            status,
            message: message.map(str::to_string),
            timestamp: Local::now().naive_local().trunc_subsecs(0),
            payload: None,
            directive: None,
        }
    }

    /// Event for a mutation that has been submitted but not yet resolved.
    pub fn pending(entity_id: Option<i64>, entity_name: Option<&str>, action: Action) -> Self {
        Self::new(entity_id, entity_name, action, Status::Pending, None)
    }

    pub fn success(
        entity_id: Option<i64>,
        entity_name: Option<&str>,
        action: Action,
        message: &str,
    ) -> Self {
        Self::new(entity_id, entity_name, action, Status::Success, Some(message))
    }

    pub fn failed(
        entity_id: Option<i64>,
        entity_name: Option<&str>,
        action: Action,
        error_message: &str,
    ) -> Self {
        Self::new(entity_id, entity_name, action, Status::Failed, Some(error_message))
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_directive(mut self, directive: TestDirective) -> Self {
        self.directive = Some(directive);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// `yyyy-MM-dd HH:mm:ss` on write; also accepts ISO-8601 with fractional
/// seconds on read.
mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .map_err(D::Error::custom)
    }
}
