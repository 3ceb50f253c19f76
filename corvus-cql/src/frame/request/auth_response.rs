use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::write_bytes_opt;

/// AUTH_RESPONSE: one step of the SASL-style challenge/response exchange.
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        write_bytes_opt(self.response.as_ref(), buf)?;
        Ok(())
    }
}
