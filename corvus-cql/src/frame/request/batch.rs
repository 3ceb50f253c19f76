use bytes::{BufMut, Bytes};
use std::borrow::Cow;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, SerialConsistency};
use crate::serialize::SerializedValues;

// Batch flags. The batch parameter block reuses the QUERY flag values,
// minus the ones that make no sense for batches.
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

/// BATCH: executes a list of statements (prepared or not) atomically
/// per-partition, with a shared consistency.
pub struct Batch<'b> {
    pub statements: Cow<'b, [BatchStatement<'b>]>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    /// Value lists, one per statement, in statement order.
    pub values: Vec<SerializedValues>,
}

/// The kind of a batch, apportioning atomicity guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// One entry of a batch: either raw CQL text or a prepared statement id.
#[derive(Clone)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Cow<'a, Bytes> },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        match self {
            BatchStatement::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            BatchStatement::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }
        Ok(())
    }
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        buf.put_u8(self.batch_type as u8);

        let n = self.statements.len();
        u16::try_from(n).map_err(|_| RequestSerializationError::TooManyValues(n))?;
        buf.put_u16(n as u16);

        for (statement, values) in self.statements.iter().zip(self.values.iter()) {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::RowValues;

    #[test]
    fn batch_body_layout() {
        let statements = vec![
            BatchStatement::Query {
                text: Cow::Borrowed("INSERT INTO t (k, v) VALUES (?, ?)"),
            },
            BatchStatement::Prepared {
                id: Cow::Owned(Bytes::from_static(b"\x01\x02")),
            },
        ];
        let batch = Batch {
            statements: Cow::Owned(statements),
            batch_type: BatchType::Unlogged,
            consistency: types::Consistency::One,
            serial_consistency: None,
            timestamp: None,
            values: vec![(1_i32, 2_i32).serialized().unwrap(), ().serialized().unwrap()],
        };
        let mut body = Vec::new();
        batch.serialize(&mut body).unwrap();

        assert_eq!(body[0], BatchType::Unlogged as u8);
        assert_eq!(&body[1..3], &2_u16.to_be_bytes());
        // First statement is an inline query.
        assert_eq!(body[3], 0);
    }
}
