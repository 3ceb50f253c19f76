use std::borrow::Cow;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, SerialConsistency};
use crate::serialize::SerializedValues;
use bytes::{Buf, BufMut};

// Query parameter flags.
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

/// QUERY: executes a single unprepared statement.
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

/// The parameter block shared by QUERY and EXECUTE.
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: PagingState,
    pub skip_metadata: bool,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: PagingState::start(),
            skip_metadata: false,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let paging_state_bytes = self.paging_state.as_bytes_slice();

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if paging_state_bytes.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }
        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }
        if let Some(paging_state_bytes) = paging_state_bytes {
            types::write_bytes(paging_state_bytes, buf)?;
        }
        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

/// Position to resume a paged request from. Cheaply clonable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagingState(Option<Arc<[u8]>>);

impl PagingState {
    /// The state of a not-yet-started paged request.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn new_from_raw_bytes(raw_paging_state: impl Into<Arc<[u8]>>) -> Self {
        Self(Some(raw_paging_state.into()))
    }

    pub fn as_bytes_slice(&self) -> Option<&Arc<[u8]>> {
        self.0.as_ref()
    }
}

/// Whether the server reported more pages after the current one.
#[derive(Debug, Clone)]
pub enum PagingStateResponse {
    HasMorePages { state: PagingState },
    NoMorePages,
}

impl PagingStateResponse {
    pub fn finished(&self) -> bool {
        matches!(*self, Self::NoMorePages)
    }

    pub fn new_from_raw_bytes(raw_paging_state: Option<&[u8]>) -> Self {
        match raw_paging_state {
            Some(raw_bytes) => Self::HasMorePages {
                state: PagingState::new_from_raw_bytes(raw_bytes),
            },
            None => Self::NoMorePages,
        }
    }

    /// Converts the response into [ControlFlow], signalling whether the
    /// request finished or should be resumed with the given [PagingState].
    pub fn into_paging_control_flow(self) -> ControlFlow<(), PagingState> {
        match self {
            Self::HasMorePages { state } => ControlFlow::Continue(state),
            Self::NoMorePages => ControlFlow::Break(()),
        }
    }
}

/// Deserialization counterpart of [QueryParameters::serialize], used by tests
/// to assert on what was actually put on the wire.
#[cfg(test)]
pub(crate) fn deserialize_query_parameters(
    buf: &mut &[u8],
) -> Result<
    (
        types::Consistency,
        Option<SerialConsistency>,
        Option<i64>,
        Option<i32>,
        bool,
        u16,
    ),
    crate::frame::frame_errors::LowLevelDeserializationError,
> {
    let consistency = types::read_consistency(buf)?;
    let flags = buf.get_u8();

    let values_count = if flags & FLAG_VALUES != 0 {
        let count = types::read_short(buf)?;
        for _ in 0..count {
            types::read_value(buf)?;
        }
        count
    } else {
        0
    };
    let skip_metadata = flags & FLAG_SKIP_METADATA != 0;
    let page_size = (flags & FLAG_PAGE_SIZE != 0)
        .then(|| types::read_int(buf))
        .transpose()?;
    if flags & FLAG_WITH_PAGING_STATE != 0 {
        types::read_bytes(buf)?;
    }
    let serial_consistency = (flags & FLAG_WITH_SERIAL_CONSISTENCY != 0)
        .then(|| types::read_serial_consistency(buf))
        .transpose()?;
    let timestamp = (flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0)
        .then(|| types::read_long(buf))
        .transpose()?;

    Ok((
        consistency,
        serial_consistency,
        timestamp,
        page_size,
        skip_metadata,
        values_count,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;
    use crate::serialize::RowValues;

    #[test]
    fn query_parameters_round_trip() {
        let values = (42_i32, "k").serialized().unwrap();
        let params = QueryParameters {
            consistency: Consistency::Quorum,
            serial_consistency: Some(SerialConsistency::LocalSerial),
            timestamp: Some(1_692_000_000_000_000),
            page_size: Some(5000),
            paging_state: PagingState::start(),
            skip_metadata: false,
            values: Cow::Owned(values),
        };
        let mut buf = Vec::new();
        params.serialize(&mut buf).unwrap();

        let (consistency, serial, timestamp, page_size, skip_metadata, value_count) =
            deserialize_query_parameters(&mut &buf[..]).unwrap();
        assert_eq!(consistency, Consistency::Quorum);
        assert_eq!(serial, Some(SerialConsistency::LocalSerial));
        assert_eq!(timestamp, Some(1_692_000_000_000_000));
        assert_eq!(page_size, Some(5000));
        assert!(!skip_metadata);
        assert_eq!(value_count, 2);
    }
}
