use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// PREPARE: compiles a statement server-side; the response carries the
/// server-assigned id and variable metadata.
pub struct Prepare<'a> {
    pub query: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_long_string(self.query, buf)?;
        Ok(())
    }
}
