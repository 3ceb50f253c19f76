//! Frame-level codec of the native protocol: the 9-byte header, body
//! compression, response extensions (tracing id, warnings, custom payload)
//! and, for protocol v5, the checksummed segment layer.

pub mod frame_errors;
pub mod protocol_features;
pub mod request;
pub mod response;
pub mod segment;
pub mod server_event_type;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::fmt::Display;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use frame_errors::FrameError;
use request::SerializableRequest;
use response::ResponseOpcode;

const HEADER_SIZE: usize = 9;

// Frame flags.
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;
const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
const FLAG_WARNING: u8 = 0x08;
const FLAG_BETA: u8 = 0x10;

/// Upper bound on a declared frame body length. Frames above it are rejected
/// as a protocol violation instead of being buffered.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Native protocol versions implemented by the driver.
///
/// The representation is the version byte as it appears on the wire
/// (without the direction bit).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V3 = 0x03,
    V4 = 0x04,
    V5 = 0x05,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::V5;

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte & 0x7F {
            0x03 => Some(ProtocolVersion::V3),
            0x04 => Some(ProtocolVersion::V4),
            0x05 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    /// The next version to fall back to when the server rejects STARTUP
    /// with a protocol error.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ProtocolVersion::V5 => Some(ProtocolVersion::V4),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => None,
        }
    }

    /// Number of stream ids usable on a single connection.
    ///
    /// v3/v4 connections are capped conservatively for parity with other
    /// drivers of this family; v5 uses the full positive i16 range.
    pub fn stream_id_pool_size(self) -> usize {
        match self {
            ProtocolVersion::V3 | ProtocolVersion::V4 => 128,
            ProtocolVersion::V5 => 32_768,
        }
    }

    /// Whether frames are enveloped in checksummed segments (§ v5 framing).
    pub fn uses_segment_layer(self) -> bool {
        self >= ProtocolVersion::V5
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

/// The wire protocol body compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 block compression, prefixed with the uncompressed length.
    Lz4,
    /// Snappy raw-block compression.
    Snappy,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame fully serialized up to the stream id, which is filled in
/// by the connection writer at send time.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let mut body = Vec::new();
            req.serialize(&mut body)?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version as u8;
        data[1] = flags;
        // Bytes 2..4 are left zeroed for the stream id.
        data[4] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    /// Marks the frame as using the beta version of the protocol.
    /// Must only be set when the beta opt-in was negotiated.
    pub fn set_beta(&mut self) {
        self.data[1] |= FLAG_BETA;
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Header fields that are not implied by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4 as u8,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Reads one response frame (header + body) from the stream.
///
/// Rejects frames from the client direction, frames of an unknown protocol
/// version, and frames whose declared body length exceeds
/// `max_frame_length`. The version actually seen is reported in the
/// returned [FrameParams]; during negotiation the server may answer with a
/// version other than the requested one.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    max_frame_length: usize,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];
    let version_byte = buf.get_u8();
    if version_byte & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if ProtocolVersion::from_wire(version_byte).is_none() {
        return Err(FrameError::VersionMismatch(version_byte & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version: version_byte,
        flags,
        stream,
    };

    let opcode_byte = buf.get_u8();
    let opcode = ResponseOpcode::try_from(opcode_byte)
        .map_err(|_| FrameError::UnknownResponseOpcode(opcode_byte))?;

    let length = buf.get_u32() as usize;
    if length > max_frame_length {
        return Err(FrameError::FrameTooLarge {
            length,
            limit: max_frame_length,
        });
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF before the whole body arrived.
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// A response body with frame-level extensions already stripped off it.
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::BodyCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::BodyDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len).map_err(|_| FrameError::BodyDecompression)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::BodyDecompression),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::Options;

    #[test]
    fn lz4_body_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        compress_append(uncomp_body.as_bytes(), Compression::Lz4, &mut comp_body).unwrap();
        assert!(comp_body.len() < uncomp_body.len());
        let result = decompress(&comp_body[..], Compression::Lz4).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn snappy_body_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "wide column storage".repeat(64);
        compress_append(uncomp_body.as_bytes(), Compression::Snappy, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], Compression::Snappy).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn serialized_request_header_layout() {
        let mut req = SerializedRequest::make(&Options, ProtocolVersion::V4, None, false).unwrap();
        req.set_stream(0x0102);
        let data = req.get_data();
        assert_eq!(data[0], 0x04);
        assert_eq!(data[1], 0x00);
        assert_eq!(&data[2..4], &[0x01, 0x02]);
        assert_eq!(data[4], request::RequestOpcode::Options as u8);
        // OPTIONS has an empty body.
        assert_eq!(&data[5..9], &[0, 0, 0, 0]);
        assert_eq!(data.len(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        // READY response declaring a body of 64 bytes against a 16-byte cap.
        let mut frame = vec![0x84, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x40];
        frame.extend_from_slice(&[0u8; 64]);
        let err = read_response_frame(&mut &frame[..], 16).await.unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { length: 64, limit: 16 }));
    }

    #[tokio::test]
    async fn request_direction_frame_is_rejected() {
        let frame = vec![0x04, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00];
        let err = read_response_frame(&mut &frame[..], 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::FrameFromClient));
    }

    #[test]
    fn protocol_version_downgrade_chain() {
        assert_eq!(ProtocolVersion::V5.downgrade(), Some(ProtocolVersion::V4));
        assert_eq!(ProtocolVersion::V4.downgrade(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V3.downgrade(), None);
    }
}
