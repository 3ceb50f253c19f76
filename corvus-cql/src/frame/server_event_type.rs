use std::fmt::Write as _;
use std::str::FromStr;

use super::frame_errors::ResponseParseError;

/// Event categories a connection can REGISTER for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        };
        f.write_str(s)
    }
}

impl EventType {
    pub fn to_cql_string(&self) -> String {
        let mut s = String::new();
        // Infallible for String.
        let _ = write!(s, "{}", self);
        s
    }
}

impl FromStr for EventType {
    type Err = ResponseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            _ => Err(ResponseParseError::UnknownEventType(s.to_owned())),
        }
    }
}
