use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};

/// OPTIONS: asks the server which STARTUP options it supports. Also doubles
/// as the driver's heartbeat request, since its body is empty and it is
/// allowed before STARTUP.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        Ok(())
    }
}
