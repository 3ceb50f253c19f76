use bytes::Bytes;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// EXECUTE: runs a previously prepared statement, addressed by its
/// server-assigned id. On protocol v5+ the frame additionally carries the
/// result metadata id the client has cached, so that the server can tell the
/// client when the cached metadata went stale.
pub struct Execute<'a> {
    pub id: Bytes,
    /// Must be `Some` exactly when the connection negotiated protocol v5+.
    pub result_metadata_id: Option<Bytes>,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_short_bytes(&self.id[..], buf)?;
        if let Some(result_metadata_id) = self.result_metadata_id.as_ref() {
            types::write_short_bytes(&result_metadata_id[..], buf)?;
        }
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_body_starts_with_statement_id() {
        let execute = Execute {
            id: Bytes::from_static(b"\xca\xfe\xba\xbe"),
            result_metadata_id: None,
            parameters: QueryParameters::default(),
        };
        let mut body = Vec::new();
        execute.serialize(&mut body).unwrap();
        let id = types::read_short_bytes(&mut &body[..]).unwrap();
        assert_eq!(id, b"\xca\xfe\xba\xbe");
    }
}
