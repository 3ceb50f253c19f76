//! RESULT frame bodies: Void, Rows, SetKeyspace, Prepared and SchemaChange.
//!
//! Row cells are kept as raw bytes. Only the handful of native types needed
//! by the driver itself (system-table reads, routing keys) get typed
//! accessors; full object mapping is a higher layer's concern.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseError};
use crate::frame::request::query::PagingStateResponse;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::response::CqlResponseKind;
use crate::frame::types;

// The RESULT body enum below shadows the prelude's Result in this module.
use std::result::Result as StdResult;

const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

// Rows/prepared metadata flags.
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_METADATA_CHANGED: i32 = 0x0008;

/// CQL type of a column, parsed from the metadata option id.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    fn deserialize(buf: &mut &[u8]) -> StdResult<Self, ResponseParseError> {
        let malformed = ResponseParseError::malformed(CqlResponseKind::Result);
        let option_id = types::read_short(buf).map_err(malformed)?;
        let typ = match option_id {
            0x0000 => {
                ColumnType::Custom(read_result_string(buf)?.to_owned())
            }
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::Bigint,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0005 => ColumnType::Counter,
            0x0006 => ColumnType::Decimal,
            0x0007 => ColumnType::Double,
            0x0008 => ColumnType::Float,
            0x0009 => ColumnType::Int,
            0x000B => ColumnType::Timestamp,
            0x000C => ColumnType::Uuid,
            0x000D => ColumnType::Varchar,
            0x000E => ColumnType::Varint,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0011 => ColumnType::Date,
            0x0012 => ColumnType::Time,
            0x0013 => ColumnType::Smallint,
            0x0014 => ColumnType::Tinyint,
            0x0015 => ColumnType::Duration,
            0x0020 => ColumnType::List(Box::new(Self::deserialize(buf)?)),
            0x0021 => ColumnType::Map(
                Box::new(Self::deserialize(buf)?),
                Box::new(Self::deserialize(buf)?),
            ),
            0x0022 => ColumnType::Set(Box::new(Self::deserialize(buf)?)),
            0x0030 => {
                let keyspace = read_result_string(buf)?.to_owned();
                let name = read_result_string(buf)?.to_owned();
                let fields_count = types::read_short(buf).map_err(malformed)?;
                let mut field_types = Vec::with_capacity(fields_count as usize);
                for _ in 0..fields_count {
                    let field_name = read_result_string(buf)?.to_owned();
                    let field_type = Self::deserialize(buf)?;
                    field_types.push((field_name, field_type));
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    field_types,
                }
            }
            0x0031 => {
                let types_count = types::read_short(buf).map_err(malformed)?;
                let mut inner_types = Vec::with_capacity(types_count as usize);
                for _ in 0..types_count {
                    inner_types.push(Self::deserialize(buf)?);
                }
                ColumnType::Tuple(inner_types)
            }
            other => return Err(ResponseParseError::UnknownTypeOption(other)),
        };
        Ok(typ)
    }
}

/// Fully qualified table a result set comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

impl TableSpec {
    fn deserialize(buf: &mut &[u8]) -> StdResult<Self, ResponseParseError> {
        Ok(TableSpec {
            ks_name: read_result_string(buf)?.to_owned(),
            table_name: read_result_string(buf)?.to_owned(),
        })
    }
}

/// One column of a result set or of a prepared statement's variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

/// Metadata of a rows result: column specs plus paging information.
#[derive(Debug, Clone)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
    /// Present on v5+ when the server detected that the client's cached
    /// metadata went stale.
    pub new_metadata_id: Option<Bytes>,
}

impl ResultMetadata {
    pub fn mock_empty() -> Self {
        ResultMetadata {
            col_count: 0,
            col_specs: Vec::new(),
            new_metadata_id: None,
        }
    }
}

fn read_result_string<'a>(buf: &mut &'a [u8]) -> StdResult<&'a str, ResponseParseError> {
    types::read_string(buf).map_err(ResponseParseError::malformed(CqlResponseKind::Result))
}

fn deserialize_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<&TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ResponseParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => TableSpec::deserialize(buf)?,
        };
        let name = read_result_string(buf)?.to_owned();
        let typ = ColumnType::deserialize(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deserialize_result_metadata(
    buf: &mut &[u8],
) -> StdResult<(ResultMetadata, PagingStateResponse), ResponseParseError> {
    let malformed = ResponseParseError::malformed(CqlResponseKind::Result);

    let flags = types::read_int(buf).map_err(malformed)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;
    let metadata_changed = flags & FLAG_METADATA_CHANGED != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResponseParseError::malformed(CqlResponseKind::Result))?;

    let raw_paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map_err(ResponseParseError::malformed(CqlResponseKind::Result)))
        .transpose()?;
    let paging_state = PagingStateResponse::new_from_raw_bytes(raw_paging_state);

    let new_metadata_id = metadata_changed
        .then(|| {
            types::read_short_bytes(buf)
                .map(Bytes::copy_from_slice)
                .map_err(ResponseParseError::malformed(CqlResponseKind::Result))
        })
        .transpose()?;

    let col_specs = if no_metadata {
        Vec::new()
    } else {
        let global_table_spec = global_tables_spec
            .then(|| TableSpec::deserialize(buf))
            .transpose()?;
        deserialize_col_specs(buf, global_table_spec.as_ref(), col_count)?
    };

    Ok((
        ResultMetadata {
            col_count,
            col_specs,
            new_metadata_id,
        },
        paging_state,
    ))
}

/// Metadata of a prepared statement's bind variables.
#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Indices of the variables that make up the partition key,
    /// in partition-key order. Served by protocol v4+; empty on v3.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

fn deserialize_prepared_metadata(
    buf: &mut &[u8],
    with_pk_indexes: bool,
) -> StdResult<PreparedMetadata, ResponseParseError> {
    let malformed = ResponseParseError::malformed(CqlResponseKind::Result);

    let flags = types::read_int(buf).map_err(malformed)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf)
        .map_err(ResponseParseError::malformed(CqlResponseKind::Result))?;

    let pk_indexes = if with_pk_indexes {
        let pk_count = types::read_int_length(buf)
            .map_err(ResponseParseError::malformed(CqlResponseKind::Result))?;
        let mut pk_indexes = Vec::with_capacity(pk_count);
        for _ in 0..pk_count {
            pk_indexes.push(
                types::read_short(buf)
                    .map_err(ResponseParseError::malformed(CqlResponseKind::Result))?,
            );
        }
        pk_indexes
    } else {
        Vec::new()
    };

    let global_table_spec = global_tables_spec
        .then(|| TableSpec::deserialize(buf))
        .transpose()?;
    let col_specs = deserialize_col_specs(buf, global_table_spec.as_ref(), col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

/// A single result row: one raw cell per column, `None` meaning NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

impl Row {
    /// Decodes the idx-th cell into a native type.
    pub fn get<T: FromCqlCell>(&self, idx: usize) -> StdResult<T, CellParseError> {
        let cell = self
            .columns
            .get(idx)
            .ok_or(CellParseError::NoSuchColumn(idx))?;
        T::from_cell(cell.as_deref())
    }
}

/// A rows result with eagerly deserialized cells.
#[derive(Debug)]
pub struct Rows {
    pub metadata: Arc<ResultMetadata>,
    pub paging_state_response: PagingStateResponse,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

impl Rows {
    /// Index of the column with the given name, if any.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata
            .col_specs
            .iter()
            .position(|spec| spec.name == name)
    }
}

/// RESULT::Prepared payload.
#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    /// v5+: id of the result metadata, sent back in EXECUTE.
    pub result_metadata_id: Option<Bytes>,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

/// RESULT::SetKeyspace payload.
#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

/// The deserialized body of a RESULT response.
#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChangeEvent),
}

/// Options steering version-dependent parts of RESULT deserialization.
#[derive(Debug, Clone, Copy)]
pub struct ResultParseOptions {
    /// v4+ sends partition-key indexes in prepared metadata.
    pub with_pk_indexes: bool,
    /// v5+ sends the result metadata id in prepared results.
    pub with_result_metadata_id: bool,
}

impl Default for ResultParseOptions {
    fn default() -> Self {
        ResultParseOptions {
            with_pk_indexes: true,
            with_result_metadata_id: false,
        }
    }
}

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, ResponseParseError> {
    deserialize_with_options(buf, ResultParseOptions::default())
}

pub fn deserialize_with_options(
    buf: &mut &[u8],
    options: ResultParseOptions,
) -> StdResult<Result, ResponseParseError> {
    let malformed = ResponseParseError::malformed(CqlResponseKind::Result);
    let result_id = types::read_int(buf).map_err(malformed)?;

    let result = match result_id {
        RESULT_VOID => Result::Void,
        RESULT_ROWS => {
            let (metadata, paging_state_response) = deserialize_result_metadata(buf)?;
            let rows_count = types::read_int_length(buf)
                .map_err(ResponseParseError::malformed(CqlResponseKind::Result))?;
            let col_count = metadata.col_count;
            let mut rows = Vec::with_capacity(rows_count);
            for _ in 0..rows_count {
                let mut columns = Vec::with_capacity(col_count);
                for _ in 0..col_count {
                    let cell = types::read_bytes_opt(buf)
                        .map_err(ResponseParseError::malformed(CqlResponseKind::Result))?
                        .map(Bytes::copy_from_slice);
                    columns.push(cell);
                }
                rows.push(Row { columns });
            }
            Result::Rows(Rows {
                metadata: Arc::new(metadata),
                paging_state_response,
                rows_count,
                rows,
            })
        }
        RESULT_SET_KEYSPACE => Result::SetKeyspace(SetKeyspace {
            keyspace_name: read_result_string(buf)?.to_owned(),
        }),
        RESULT_PREPARED => {
            let id = Bytes::copy_from_slice(
                types::read_short_bytes(buf)
                    .map_err(ResponseParseError::malformed(CqlResponseKind::Result))?,
            );
            let result_metadata_id = options
                .with_result_metadata_id
                .then(|| {
                    types::read_short_bytes(buf)
                        .map(Bytes::copy_from_slice)
                        .map_err(ResponseParseError::malformed(CqlResponseKind::Result))
                })
                .transpose()?;
            let prepared_metadata =
                deserialize_prepared_metadata(buf, options.with_pk_indexes)?;
            let (result_metadata, _) = deserialize_result_metadata(buf)?;
            Result::Prepared(Prepared {
                id,
                result_metadata_id,
                prepared_metadata,
                result_metadata,
            })
        }
        RESULT_SCHEMA_CHANGE => Result::SchemaChange(SchemaChangeEvent::deserialize(buf)?),
        other => return Err(ResponseParseError::UnknownResultId(other)),
    };

    Ok(result)
}

/// An error while decoding a single result cell into a native type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CellParseError {
    #[error("Row has no column with index {0}")]
    NoSuchColumn(usize),
    #[error("Unexpected NULL where a value was required")]
    UnexpectedNull,
    #[error("Cell has invalid length {got}, expected {expected}")]
    BadLength { expected: usize, got: usize },
    #[error("Cell is not valid UTF-8")]
    BadUtf8,
    #[error(transparent)]
    Malformed(#[from] LowLevelDeserializationError),
}

/// Native types decodable from a raw result cell. Covers exactly what the
/// driver needs to read its own system queries.
pub trait FromCqlCell: Sized {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError>;
}

fn required(cell: Option<&[u8]>) -> StdResult<&[u8], CellParseError> {
    cell.ok_or(CellParseError::UnexpectedNull)
}

fn fixed<const N: usize>(raw: &[u8]) -> StdResult<[u8; N], CellParseError> {
    raw.try_into().map_err(|_| CellParseError::BadLength {
        expected: N,
        got: raw.len(),
    })
}

impl<T: FromCqlCell> FromCqlCell for Option<T> {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        match cell {
            None => Ok(None),
            some => T::from_cell(some).map(Some),
        }
    }
}

impl FromCqlCell for i32 {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        Ok(i32::from_be_bytes(fixed(required(cell)?)?))
    }
}

impl FromCqlCell for i64 {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        Ok(i64::from_be_bytes(fixed(required(cell)?)?))
    }
}

impl FromCqlCell for bool {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        Ok(fixed::<1>(required(cell)?)?[0] != 0)
    }
}

impl FromCqlCell for String {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        std::str::from_utf8(required(cell)?)
            .map(ToOwned::to_owned)
            .map_err(|_| CellParseError::BadUtf8)
    }
}

impl FromCqlCell for Uuid {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        Ok(Uuid::from_bytes(fixed(required(cell)?)?))
    }
}

impl FromCqlCell for IpAddr {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        let raw = required(cell)?;
        match raw.len() {
            4 => Ok(IpAddr::from(fixed::<4>(raw)?)),
            16 => Ok(IpAddr::from(fixed::<16>(raw)?)),
            got => Err(CellParseError::BadLength { expected: 4, got }),
        }
    }
}

// Collections of text (list<text>/set<text>): [int n] then n length-prefixed elements.
impl FromCqlCell for Vec<String> {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        let mut raw = required(cell)?;
        let count = types::read_int_length(&mut raw)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let elem = types::read_bytes(&mut raw)?;
            out.push(
                std::str::from_utf8(elem)
                    .map(ToOwned::to_owned)
                    .map_err(|_| CellParseError::BadUtf8)?,
            );
        }
        Ok(out)
    }
}

// map<text, text>, used by replication options in schema tables.
impl FromCqlCell for HashMap<String, String> {
    fn from_cell(cell: Option<&[u8]>) -> StdResult<Self, CellParseError> {
        let mut raw = required(cell)?;
        let count = types::read_int_length(&mut raw)?;
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = std::str::from_utf8(types::read_bytes(&mut raw)?)
                .map_err(|_| CellParseError::BadUtf8)?
                .to_owned();
            let val = std::str::from_utf8(types::read_bytes(&mut raw)?)
                .map_err(|_| CellParseError::BadUtf8)?
                .to_owned();
            out.insert(key, val);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows_body() -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(RESULT_ROWS, &mut buf);
        // Metadata: global table spec, 2 columns.
        types::write_int(FLAG_GLOBAL_TABLES_SPEC, &mut buf);
        types::write_int(2, &mut buf);
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tab", &mut buf).unwrap();
        types::write_string("k", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf); // int
        types::write_string("v", &mut buf).unwrap();
        types::write_short(0x000D, &mut buf); // varchar
        // 1 row.
        types::write_int(1, &mut buf);
        types::write_bytes(&42_i32.to_be_bytes(), &mut buf).unwrap();
        types::write_bytes(b"forty-two", &mut buf).unwrap();
        buf
    }

    #[test]
    fn rows_round_trip() {
        let body = sample_rows_body();
        let result = deserialize(&mut &body[..]).unwrap();
        let rows = match result {
            Result::Rows(rows) => rows,
            other => panic!("expected rows, got {:?}", other),
        };
        assert_eq!(rows.rows_count, 1);
        assert_eq!(rows.metadata.col_specs.len(), 2);
        assert_eq!(rows.metadata.col_specs[0].typ, ColumnType::Int);
        assert_eq!(rows.column_index("v"), Some(1));
        assert_eq!(rows.rows[0].get::<i32>(0).unwrap(), 42);
        assert_eq!(rows.rows[0].get::<String>(1).unwrap(), "forty-two");
    }

    #[test]
    fn prepared_round_trip_with_pk_indexes() {
        let mut buf = Vec::new();
        types::write_int(RESULT_PREPARED, &mut buf);
        types::write_short_bytes(b"\xfe\xed", &mut buf).unwrap();
        // Prepared metadata: global spec, 2 variables, pk = [0].
        types::write_int(FLAG_GLOBAL_TABLES_SPEC, &mut buf);
        types::write_int(2, &mut buf);
        types::write_int(1, &mut buf);
        types::write_short(0, &mut buf);
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tab", &mut buf).unwrap();
        types::write_string("k", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf);
        types::write_string("v", &mut buf).unwrap();
        types::write_short(0x000D, &mut buf);
        // Result metadata: no columns.
        types::write_int(0, &mut buf);
        types::write_int(0, &mut buf);

        let result = deserialize(&mut &buf[..]).unwrap();
        let prepared = match result {
            Result::Prepared(p) => p,
            other => panic!("expected prepared, got {:?}", other),
        };
        assert_eq!(&prepared.id[..], b"\xfe\xed");
        assert_eq!(prepared.prepared_metadata.pk_indexes, vec![0]);
        assert_eq!(prepared.prepared_metadata.col_specs.len(), 2);
    }

    #[test]
    fn set_keyspace_round_trip() {
        let mut buf = Vec::new();
        types::write_int(RESULT_SET_KEYSPACE, &mut buf);
        types::write_string("ks", &mut buf).unwrap();
        let result = deserialize(&mut &buf[..]).unwrap();
        assert!(matches!(result, Result::SetKeyspace(SetKeyspace { keyspace_name }) if keyspace_name == "ks"));
    }

    #[test]
    fn collection_cells_decode() {
        // set<text> with two elements, as laid out inside a cell.
        let mut cell = Vec::new();
        types::write_int(2, &mut cell);
        types::write_bytes(b"-9223372036854775808", &mut cell).unwrap();
        types::write_bytes(b"3074457345618258602", &mut cell).unwrap();
        let tokens: Vec<String> = FromCqlCell::from_cell(Some(&cell[..])).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], "-9223372036854775808");
    }
}
