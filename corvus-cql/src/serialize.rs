//! Serialization of bound statement values into the wire representation.
//!
//! Rich object mapping is intentionally not provided here; this module only
//! knows how to turn native Rust scalars (and options thereof) into `[value]`
//! cells, which is all the runtime needs to bind variables and derive
//! routing keys.

use bytes::BufMut;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::types::{self, RawValue};

/// An error while appending a value to a [SerializedValues] buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 65535 values can be sent in a request")]
    TooManyValues,
    #[error("Value too big to be sent in a request (got {0} bytes)")]
    ValueTooBig(usize),
}

/// A scalar that can be encoded as a single `[value]` cell.
pub trait SerializeValue {
    /// Appends the serialized representation (without the length prefix)
    /// to `buf`, or returns `None` buffer-untouched for a NULL.
    fn serialize_cell(&self) -> Option<Vec<u8>>;
}

macro_rules! impl_serialize_via_be_bytes {
    ($($t:ty),*) => {
        $(impl SerializeValue for $t {
            fn serialize_cell(&self) -> Option<Vec<u8>> {
                Some(self.to_be_bytes().to_vec())
            }
        })*
    };
}

impl_serialize_via_be_bytes!(i8, i16, i32, i64, f32, f64);

impl SerializeValue for bool {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        Some(vec![u8::from(*self)])
    }
}

impl SerializeValue for &str {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        Some(self.as_bytes().to_vec())
    }
}

impl SerializeValue for String {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        Some(self.as_bytes().to_vec())
    }
}

impl SerializeValue for &[u8] {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        Some(self.to_vec())
    }
}

impl SerializeValue for Vec<u8> {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        Some(self.clone())
    }
}

impl SerializeValue for Uuid {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        Some(self.as_bytes().to_vec())
    }
}

impl<T: SerializeValue> SerializeValue for Option<T> {
    fn serialize_cell(&self) -> Option<Vec<u8>> {
        self.as_ref().and_then(SerializeValue::serialize_cell)
    }
}

/// A set of values bound to a statement, in their final wire form.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues {
        serialized_values: Vec::new(),
        element_count: 0,
    };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized_values.len()
    }

    /// Appends a value cell.
    pub fn add_value(&mut self, value: &impl SerializeValue) -> Result<(), SerializeValuesError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }
        match value.serialize_cell() {
            Some(cell) => {
                if i32::try_from(cell.len()).is_err() {
                    return Err(SerializeValuesError::ValueTooBig(cell.len()));
                }
                types::write_int(cell.len() as i32, &mut self.serialized_values);
                self.serialized_values.extend_from_slice(&cell);
            }
            None => types::write_int(-1, &mut self.serialized_values),
        }
        self.element_count += 1;
        Ok(())
    }

    /// Writes the value-count header and the raw cells into a request body.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized_values);
    }

    /// Iterates over the cells in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        SerializedValuesIterator {
            buf: &self.serialized_values,
        }
    }

    /// Returns the n-th cell, if present and non-null.
    pub fn get(&self, index: u16) -> Option<RawValue<'_>> {
        self.iter().nth(index as usize)
    }
}

struct SerializedValuesIterator<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = RawValue<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        types::read_value(&mut self.buf).ok()
    }
}

/// A row of values bindable to a statement, e.g. a tuple of scalars.
pub trait RowValues {
    fn serialized(&self) -> Result<SerializedValues, SerializeValuesError>;
}

impl RowValues for SerializedValues {
    fn serialized(&self) -> Result<SerializedValues, SerializeValuesError> {
        Ok(self.clone())
    }
}

impl RowValues for () {
    fn serialized(&self) -> Result<SerializedValues, SerializeValuesError> {
        Ok(SerializedValues::new())
    }
}

impl<T: SerializeValue> RowValues for [T] {
    fn serialized(&self) -> Result<SerializedValues, SerializeValuesError> {
        let mut values = SerializedValues::new();
        for v in self {
            values.add_value(v)?;
        }
        Ok(values)
    }
}

impl<T: SerializeValue> RowValues for &[T] {
    fn serialized(&self) -> Result<SerializedValues, SerializeValuesError> {
        (**self).serialized()
    }
}

macro_rules! impl_row_values_for_tuple {
    ($($idx:tt : $typ:ident),*) => {
        impl<$($typ: SerializeValue),*> RowValues for ($($typ,)*) {
            fn serialized(&self) -> Result<SerializedValues, SerializeValuesError> {
                let mut values = SerializedValues::new();
                $(values.add_value(&self.$idx)?;)*
                Ok(values)
            }
        }
    };
}

impl_row_values_for_tuple!(0: A);
impl_row_values_for_tuple!(0: A, 1: B);
impl_row_values_for_tuple!(0: A, 1: B, 2: C);
impl_row_values_for_tuple!(0: A, 1: B, 2: C, 3: D);
impl_row_values_for_tuple!(0: A, 1: B, 2: C, 3: D, 4: E);
impl_row_values_for_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);
impl_row_values_for_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G);
impl_row_values_for_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F, 6: G, 7: H);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_preserve_order_and_nulls() {
        let mut values = SerializedValues::new();
        values.add_value(&42_i32).unwrap();
        values.add_value(&Option::<i32>::None).unwrap();
        values.add_value(&"text").unwrap();

        let cells: Vec<_> = values.iter().collect();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0], RawValue::Value(&42_i32.to_be_bytes()));
        assert_eq!(cells[1], RawValue::Null);
        assert_eq!(cells[2], RawValue::Value(b"text"));
        assert_eq!(values.element_count(), 3);
    }

    #[test]
    fn tuple_binding() {
        let values = (7_i64, "k", Uuid::nil()).serialized().unwrap();
        assert_eq!(values.element_count(), 3);
        assert_eq!(values.get(0), Some(RawValue::Value(&7_i64.to_be_bytes()[..])));
    }

    #[test]
    fn request_header_carries_count() {
        let values = (1_i32, 2_i32).serialized().unwrap();
        let mut buf = Vec::new();
        values.write_to_request(&mut buf);
        assert_eq!(&buf[..2], &2u16.to_be_bytes());
    }
}
