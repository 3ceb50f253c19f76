use std::collections::HashMap;

use crate::frame::frame_errors::ResponseParseError;
use crate::frame::response::CqlResponseKind;
use crate::frame::types;

/// SUPPORTED: the server's reply to OPTIONS, listing supported STARTUP
/// options (protocol versions, compression algorithms, extensions).
#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(ResponseParseError::malformed(CqlResponseKind::Supported))?;
        Ok(Supported { options })
    }
}
