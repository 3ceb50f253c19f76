use std::borrow::Cow;
use std::collections::HashMap;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

// Keys recognized in STARTUP options.
pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "4.0.0";
pub const COMPRESSION: &str = "COMPRESSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";
pub const APPLICATION_NAME: &str = "APPLICATION_NAME";
pub const APPLICATION_VERSION: &str = "APPLICATION_VERSION";
pub const CLIENT_ID: &str = "CLIENT_ID";

pub const DEFAULT_DRIVER_NAME: &str = "Corvus Rust Driver";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// STARTUP: initializes the connection, carrying the requested options.
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_body_is_a_string_map() {
        let mut options = HashMap::new();
        options.insert(Cow::Borrowed(CQL_VERSION), Cow::Borrowed("4.0.0"));
        let startup = Startup { options };
        let mut body = Vec::new();
        startup.serialize(&mut body).unwrap();
        let decoded = types::read_string_map(&mut &body[..]).unwrap();
        assert_eq!(decoded.get(CQL_VERSION).map(String::as_str), Some("4.0.0"));
    }
}
