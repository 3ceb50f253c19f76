//! Primitive in-wire types of the native protocol: `[int]`, `[short]`,
//! `[string]`, `[bytes]` and friends, always big-endian.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str;
use uuid::Uuid;

use super::frame_errors::LowLevelDeserializationError;

/// Consistency level of a request, as encoded in QUERY/EXECUTE/BATCH parameters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    #[default]
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl TryFrom<u16> for Consistency {
    type Error = LowLevelDeserializationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            0x000A => Ok(Consistency::LocalOne),
            other => Err(LowLevelDeserializationError::UnknownConsistency(other)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Serial consistency used by the Paxos phase of lightweight transactions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<u16> for SerialConsistency {
    type Error = LowLevelDeserializationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0008 => Ok(SerialConsistency::Serial),
            0x0009 => Ok(SerialConsistency::LocalSerial),
            other => Err(LowLevelDeserializationError::NonSerialConsistency(other)),
        }
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    Ok(buf.read_i32::<BigEndian>()?)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    usize::try_from(v).map_err(|_| LowLevelDeserializationError::InvalidLength(v))
}

pub(crate) fn write_int_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: i32 = v.try_into()?;
    write_int(v, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    Ok(buf.read_i64::<BigEndian>()?)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    Ok(buf.read_u16::<BigEndian>()?)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(read_short(buf)?.into())
}

pub(crate) fn write_short_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

/// An `[bytes]` value: length-prefixed, with negative length meaning null.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(read_raw_bytes(len as usize, buf)?))
}

pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf)?,
        None => write_int(-1, buf),
    }
    Ok(())
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    Ok(str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    Ok(str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(
    v: &[String],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for s in v {
        write_string(s, buf)?;
    }
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = Bytes::copy_from_slice(read_bytes(buf)?);
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_bytes_map<B: AsRef<[u8]>>(
    v: &HashMap<String, B>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_bytes(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    // Safe: the slice is exactly 16 bytes long.
    let raw_array: &[u8; 16] = raw.try_into().unwrap();
    Ok(Uuid::from_bytes(*raw_array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid.as_bytes()[..]);
}

/// An `[inet]` value: one-byte address length, address bytes, then an `[int]` port.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let len = buf.read_u8()?;
    let ip_addr: IpAddr = match len {
        4 => {
            let raw: [u8; 4] = read_raw_bytes(4, buf)?.try_into().unwrap();
            IpAddr::from(raw)
        }
        16 => {
            let raw: [u8; 16] = read_raw_bytes(16, buf)?.try_into().unwrap();
            IpAddr::from(raw)
        }
        v => return Err(LowLevelDeserializationError::InvalidInetLength(v)),
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip_addr, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
    write_int(addr.port() as i32, buf);
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    Consistency::try_from(read_short(buf)?)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn read_serial_consistency(
    buf: &mut &[u8],
) -> Result<SerialConsistency, LowLevelDeserializationError> {
    SerialConsistency::try_from(read_short(buf)?)
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// A bound value on the wire: `[value]` is `[bytes]` extended with -2 meaning "unset".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

pub fn read_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    match len {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => Ok(RawValue::Value(read_raw_bytes(len as usize, buf)?)),
        len => Err(LowLevelDeserializationError::InvalidValueLength(len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn type_int_round_trip() {
        for val in [i32::MIN, -1, 0, 1, i32::MAX] {
            let mut buf = Vec::new();
            write_int(val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn type_long_round_trip() {
        for val in [i64::MIN, -1, 0, 1, i64::MAX] {
            let mut buf = Vec::new();
            write_long(val, &mut buf);
            assert_eq!(read_long(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn type_string_round_trip() {
        for val in ["", "hello, world!"] {
            let mut buf = Vec::new();
            write_string(val, &mut buf).unwrap();
            assert_eq!(read_string(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn type_string_multimap_round_trip() {
        let mut val = HashMap::new();
        val.insert("COMPRESSION".to_owned(), vec!["lz4".to_owned(), "snappy".to_owned()]);
        val.insert("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()]);
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_inet_round_trip() {
        let addrs: [SocketAddr; 2] = ["127.0.0.1:9042".parse().unwrap(), "[2001:db8::1]:19042".parse().unwrap()];
        for addr in addrs {
            let mut buf = Vec::new();
            write_inet(addr, &mut buf);
            assert_eq!(read_inet(&mut &buf[..]).unwrap(), addr);
        }
    }

    #[test]
    fn type_uuid_round_trip() {
        let id = Uuid::new_v4();
        let mut buf = Vec::new();
        write_uuid(&id, &mut buf);
        assert_eq!(read_uuid(&mut &buf[..]).unwrap(), id);
    }

    #[test]
    fn consistency_rejects_unknown_value() {
        assert!(Consistency::try_from(0x1234_u16).is_err());
    }

    #[test]
    fn value_sentinels() {
        let mut buf = Vec::new();
        write_int(-1, &mut buf);
        write_int(-2, &mut buf);
        let mut slice = &buf[..];
        assert_eq!(read_value(&mut slice).unwrap(), RawValue::Null);
        assert_eq!(read_value(&mut slice).unwrap(), RawValue::Unset);
    }
}
