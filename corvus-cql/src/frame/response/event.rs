use std::net::SocketAddr;

use crate::frame::frame_errors::ResponseParseError;
use crate::frame::response::CqlResponseKind;
use crate::frame::server_event_type::EventType;
use crate::frame::types;

/// EVENT: a push frame delivered on stream -1 to connections that REGISTERed.
#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

impl SchemaChangeEvent {
    pub fn keyspace_name(&self) -> &str {
        match self {
            SchemaChangeEvent::KeyspaceChange { keyspace_name, .. }
            | SchemaChangeEvent::TableChange { keyspace_name, .. }
            | SchemaChangeEvent::TypeChange { keyspace_name, .. }
            | SchemaChangeEvent::FunctionChange { keyspace_name, .. }
            | SchemaChangeEvent::AggregateChange { keyspace_name, .. } => keyspace_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let malformed = ResponseParseError::malformed(CqlResponseKind::Event);
        let event_type: EventType = types::read_string(buf).map_err(malformed)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }
}

fn read_event_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ResponseParseError> {
    types::read_string(buf).map_err(ResponseParseError::malformed(CqlResponseKind::Event))
}

fn read_event_inet(buf: &mut &[u8]) -> Result<SocketAddr, ResponseParseError> {
    types::read_inet(buf).map_err(ResponseParseError::malformed(CqlResponseKind::Event))
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let type_of_change = read_event_string(buf)?.to_owned();
        let addr = read_event_inet(buf)?;
        match type_of_change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ResponseParseError::UnknownChangeType(type_of_change)),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let type_of_change = read_event_string(buf)?.to_owned();
        let addr = read_event_inet(buf)?;
        match type_of_change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ResponseParseError::UnknownChangeType(type_of_change)),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let change_type = match read_event_string(buf)? {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = read_event_string(buf)?.to_owned();
        let keyspace_name = read_event_string(buf)?.to_owned();

        let read_arguments = |buf: &mut &[u8]| -> Result<Vec<String>, ResponseParseError> {
            let count = types::read_short(buf)
                .map_err(ResponseParseError::malformed(CqlResponseKind::Event))?;
            let mut arguments = Vec::with_capacity(count as usize);
            for _ in 0..count {
                arguments.push(read_event_string(buf)?.to_owned());
            }
            Ok(arguments)
        };

        match target.as_str() {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type,
                keyspace_name,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type,
                keyspace_name,
                object_name: read_event_string(buf)?.to_owned(),
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type,
                keyspace_name,
                type_name: read_event_string(buf)?.to_owned(),
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type,
                keyspace_name,
                function_name: read_event_string(buf)?.to_owned(),
                arguments: read_arguments(buf)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type,
                keyspace_name,
                aggregate_name: read_event_string(buf)?.to_owned(),
                arguments: read_arguments(buf)?,
            }),
            _ => Err(ResponseParseError::UnknownSchemaChangeTarget(target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn encode_event(event_type: &str, change: &str, addr: SocketAddr) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_string(event_type, &mut buf).unwrap();
        types::write_string(change, &mut buf).unwrap();
        types::write_inet(addr, &mut buf);
        buf
    }

    #[test]
    fn deserialize_new_node_event() {
        let addr: SocketAddr = "10.0.0.4:9042".parse().unwrap();
        let buf = encode_event("TOPOLOGY_CHANGE", "NEW_NODE", addr);
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(
            matches!(event, Event::TopologyChange(TopologyChangeEvent::NewNode(a)) if a == addr)
        );
    }

    #[test]
    fn deserialize_status_down_event() {
        let addr: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        let buf = encode_event("STATUS_CHANGE", "DOWN", addr);
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(matches!(event, Event::StatusChange(StatusChangeEvent::Down(a)) if a == addr));
    }

    #[test]
    fn deserialize_keyspace_schema_change() {
        let mut buf = Vec::new();
        types::write_string("SCHEMA_CHANGE", &mut buf).unwrap();
        types::write_string("CREATED", &mut buf).unwrap();
        types::write_string("KEYSPACE", &mut buf).unwrap();
        types::write_string("ks", &mut buf).unwrap();
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(matches!(
            event,
            Event::SchemaChange(SchemaChangeEvent::KeyspaceChange {
                change_type: SchemaChangeType::Created,
                ..
            })
        ));
    }
}
