use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::server_event_type::EventType;
use crate::frame::types;

/// REGISTER: subscribes the connection to the given server event categories.
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        let event_types_list = self
            .event_types_to_register_for
            .iter()
            .map(EventType::to_cql_string)
            .collect::<Vec<_>>();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}
