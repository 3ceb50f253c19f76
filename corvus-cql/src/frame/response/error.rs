use bytes::Bytes;

use crate::errors::{DbError, OperationType, WriteType};
use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseError};
use crate::frame::protocol_features::ProtocolFeatures;
use crate::frame::response::CqlResponseKind;
use crate::frame::types;

/// ERROR: an error code, a human-readable reason, and code-specific fields.
#[derive(Debug)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(
        features: &ProtocolFeatures,
        buf: &mut &[u8],
    ) -> Result<Self, ResponseParseError> {
        let malformed = ResponseParseError::malformed(CqlResponseKind::Error);
        Self::deserialize_inner(features, buf).map_err(malformed)
    }

    fn deserialize_inner(
        features: &ProtocolFeatures,
        buf: &mut &[u8],
    ) -> Result<Self, LowLevelDeserializationError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError(reason.clone()),
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: read_byte(buf)? != 0,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: read_byte(buf)? != 0,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_owned(),
                function: types::read_string(buf)?.to_owned(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_owned(),
                table: types::read_string(buf)?.to_owned(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            },
            code if Some(code) == features.rate_limit_error => DbError::RateLimitReached {
                op_type: OperationType::from(read_byte(buf)?),
                rejected_by_coordinator: read_byte(buf)? != 0,
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

fn read_byte(buf: &mut &[u8]) -> Result<u8, LowLevelDeserializationError> {
    Ok(types::read_raw_bytes(1, buf)?[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize_error_header(code: i32, reason: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(code, &mut buf);
        types::write_string(reason, &mut buf).unwrap();
        buf
    }

    #[test]
    fn deserialize_unprepared_error() {
        let mut buf = serialize_error_header(0x2500, "unknown statement");
        types::write_short_bytes(b"\xde\xad", &mut buf).unwrap();

        let error = Error::deserialize(&ProtocolFeatures::default(), &mut &buf[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(b"\xde\xad")
            }
        );
        assert_eq!(error.reason, "unknown statement");
    }

    #[test]
    fn deserialize_unavailable_error() {
        let mut buf = serialize_error_header(0x1000, "not enough replicas");
        types::write_consistency(types::Consistency::Quorum, &mut buf);
        types::write_int(2, &mut buf);
        types::write_int(1, &mut buf);

        let error = Error::deserialize(&ProtocolFeatures::default(), &mut &buf[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::Unavailable {
                consistency: types::Consistency::Quorum,
                required: 2,
                alive: 1,
            }
        );
    }

    #[test]
    fn unknown_code_is_preserved() {
        let buf = serialize_error_header(0x7777, "peculiar");
        let error = Error::deserialize(&ProtocolFeatures::default(), &mut &buf[..]).unwrap();
        assert_eq!(error.error, DbError::Other(0x7777));
    }
}
