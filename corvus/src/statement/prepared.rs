use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use corvus_cql::frame::response::result::{PreparedMetadata, ResultMetadata};
use corvus_cql::frame::types::RawValue;
use corvus_cql::serialize::SerializedValues;

use super::unprepared::Statement;
use super::{Consistency, PageSize, SerialConsistency, StatementConfig};
use crate::routing::partitioner::PartitionerName;
use crate::routing::{calculate_token_for_partition_key, Token, TokenCalculationError};

/// A server-side compiled statement.
///
/// Identified cluster-wide by the opaque id assigned at PREPARE time.
/// Carries the variable metadata needed to derive routing keys and the
/// cached result metadata (refreshed when a v5+ server reports a new
/// result metadata id).
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    data: Arc<PreparedStatementSharedData>,
    pub(crate) config: StatementConfig,
    page_size: PageSize,
    partitioner_name: PartitionerName,
}

#[derive(Debug)]
struct PreparedStatementSharedData {
    id: Bytes,
    statement: String,
    keyspace_hint: Option<String>,
    prepared_metadata: PreparedMetadata,
    /// v5+: the id of `result_metadata`, echoed in EXECUTE frames.
    result_metadata_id: ArcSwapOption<Bytes>,
    result_metadata: ArcSwapOption<ResultMetadata>,
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        statement: &Statement,
        keyspace_hint: Option<String>,
        prepared_metadata: PreparedMetadata,
        result_metadata_id: Option<Bytes>,
        result_metadata: ResultMetadata,
        partitioner_name: PartitionerName,
    ) -> Self {
        Self {
            data: Arc::new(PreparedStatementSharedData {
                id,
                statement: statement.contents.clone(),
                keyspace_hint,
                prepared_metadata,
                result_metadata_id: ArcSwapOption::from_pointee(result_metadata_id),
                result_metadata: ArcSwapOption::from_pointee(result_metadata),
            }),
            config: statement.config.clone(),
            page_size: statement.get_validated_page_size(),
            partitioner_name,
        }
    }

    /// The server-assigned statement id. Compared by content.
    pub fn get_id(&self) -> &Bytes {
        &self.data.id
    }

    /// The original statement text.
    pub fn get_statement(&self) -> &str {
        &self.data.statement
    }

    /// The keyspace the statement was prepared under, if any.
    pub fn get_keyspace_hint(&self) -> Option<&str> {
        self.data.keyspace_hint.as_deref()
    }

    pub(crate) fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.data.prepared_metadata
    }

    pub(crate) fn get_result_metadata_id(&self) -> Option<Arc<Bytes>> {
        self.data.result_metadata_id.load_full()
    }

    pub(crate) fn get_result_metadata(&self) -> Option<Arc<ResultMetadata>> {
        self.data.result_metadata.load_full()
    }

    pub(crate) fn update_result_metadata(
        &self,
        id: Option<Bytes>,
        metadata: Arc<ResultMetadata>,
    ) {
        self.data.result_metadata.store(Some(metadata));
        self.data.result_metadata_id.store(id.map(Arc::new));
    }

    /// Whether the statement's partition key can be derived from bound
    /// values, enabling token-aware routing.
    pub fn is_token_aware(&self) -> bool {
        !self.data.prepared_metadata.pk_indexes.is_empty()
    }

    /// Serializes the partition key of the given bound values into the
    /// composite routing-key layout.
    pub fn compute_partition_key(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Bytes, PartitionKeyError> {
        let pk_indexes = &self.data.prepared_metadata.pk_indexes;
        let mut buf = BytesMut::new();

        if let [only_index] = pk_indexes.as_slice() {
            let value = require_value(bound_values, *only_index)?;
            buf.extend_from_slice(value);
        } else {
            for index in pk_indexes.iter() {
                let value = require_value(bound_values, *index)?;
                let value_len: u16 = value
                    .len()
                    .try_into()
                    .map_err(|_| TokenCalculationError::ValueTooLong(value.len()))?;
                buf.put_u16(value_len);
                buf.extend_from_slice(value);
                buf.put_u8(0);
            }
        }
        Ok(buf.freeze())
    }

    /// Computes the ring token of the given bound values, or `None` when
    /// the statement has no derivable partition key.
    pub fn calculate_token(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<Token>, PartitionKeyError> {
        if !self.is_token_aware() {
            return Ok(None);
        }

        let mut pk_values = SerializedValues::new();
        for index in self.data.prepared_metadata.pk_indexes.iter() {
            let value = require_value(bound_values, *index)?;
            pk_values
                .add_value(&value)
                .map_err(|_| TokenCalculationError::ValueTooLong(value.len()))?;
        }

        calculate_token_for_partition_key(&pk_values, &self.partitioner_name)
            .map(Some)
            .map_err(PartitionKeyError::from)
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = PageSize::new(page_size);
    }

    pub(crate) fn get_validated_page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = Some(sc);
    }

    /// Marks the statement as idempotent, making it eligible for
    /// speculative execution and transport-error retries.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout;
    }
}

fn require_value(
    bound_values: &SerializedValues,
    index: u16,
) -> Result<&[u8], PartitionKeyError> {
    match bound_values.get(index) {
        Some(RawValue::Value(value)) => Ok(value),
        Some(RawValue::Null) | Some(RawValue::Unset) => {
            Err(PartitionKeyError::NullValue(index))
        }
        None => Err(PartitionKeyError::NoSuchValue(index)),
    }
}

/// Deriving the partition key from bound values failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PartitionKeyError {
    #[error("Partition key references bind-marker index {0}, but no such value was bound")]
    NoSuchValue(u16),
    #[error("Partition key component at bind-marker index {0} is NULL or unset")]
    NullValue(u16),
    #[error(transparent)]
    TokenCalculation(#[from] TokenCalculationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvus_cql::frame::response::result::PreparedMetadata;
    use corvus_cql::serialize::RowValues;

    fn prepared_with_pk_indexes(pk_indexes: Vec<u16>) -> PreparedStatement {
        PreparedStatement::new(
            Bytes::from_static(b"\x01\x02"),
            &Statement::new("INSERT INTO t (k, v) VALUES (?, ?)"),
            None,
            PreparedMetadata {
                flags: 0,
                col_count: 2,
                pk_indexes,
                col_specs: Vec::new(),
            },
            None,
            ResultMetadata::mock_empty(),
            PartitionerName::Murmur3,
        )
    }

    #[test]
    fn token_for_single_int_partition_key() {
        let prepared = prepared_with_pk_indexes(vec![0]);
        let values = (42_i32, "v").serialized().unwrap();
        let token = prepared.calculate_token(&values).unwrap().unwrap();
        assert_eq!(token.value(), -7160136740246525330);
    }

    #[test]
    fn no_pk_indexes_means_no_token() {
        let prepared = prepared_with_pk_indexes(vec![]);
        let values = (42_i32,).serialized().unwrap();
        assert_eq!(prepared.calculate_token(&values).unwrap(), None);
    }

    #[test]
    fn null_pk_component_is_an_error() {
        let prepared = prepared_with_pk_indexes(vec![0]);
        let values = (Option::<i32>::None, "v").serialized().unwrap();
        assert_eq!(
            prepared.calculate_token(&values),
            Err(PartitionKeyError::NullValue(0))
        );
    }

    #[test]
    fn composite_partition_key_layout() {
        let prepared = prepared_with_pk_indexes(vec![0, 1]);
        let values = (1_i32, "ab").serialized().unwrap();
        let pk = prepared.compute_partition_key(&values).unwrap();
        // [len][bytes][0] per component.
        let expected: &[u8] = &[0, 4, 0, 0, 0, 1, 0, 0, 2, b'a', b'b', 0];
        assert_eq!(&pk[..], expected);
    }
}
