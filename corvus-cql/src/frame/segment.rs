//! The protocol-v5 segment layer.
//!
//! Starting with v5, frames are not written directly to the stream. Instead
//! one or more frames (or a slice of a single large frame) are packed into a
//! *segment*: a checksummed envelope consisting of a 3-byte little-endian
//! header word (17 bits of payload length, 1 bit of "self-contained" flag),
//! a CRC32C of that header, the payload itself, and a trailing CRC32C of the
//! payload. A checksum mismatch is a protocol violation and kills the
//! connection.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame_errors::FrameError;

/// Maximum number of payload bytes a single segment can carry (17-bit length).
pub const MAX_SEGMENT_PAYLOAD: usize = (1 << 17) - 1;

const HEADER_SIZE: usize = 3 + 4;
const SELF_CONTAINED_BIT: u32 = 1 << 17;

/// A decoded segment envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// True when the payload holds a whole number of frames; false when it
    /// is a slice of one frame larger than [MAX_SEGMENT_PAYLOAD].
    pub self_contained: bool,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(self_contained: bool, payload: Vec<u8>) -> Self {
        Self {
            self_contained,
            payload,
        }
    }

    /// Serializes the segment, including both checksums.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(FrameError::SegmentTooLarge(self.payload.len()));
        }

        let mut header_word = self.payload.len() as u32;
        if self.self_contained {
            header_word |= SELF_CONTAINED_BIT;
        }
        let header_bytes = header_word.to_le_bytes();
        out.put_slice(&header_bytes[..3]);
        out.put_u32_le(crc32c::crc32c(&header_bytes[..3]));

        out.put_slice(&self.payload);
        out.put_u32_le(crc32c::crc32c(&self.payload));
        Ok(())
    }

    /// Reads one segment from the stream, validating both checksums.
    pub async fn read(reader: &mut (impl AsyncRead + Unpin)) -> Result<Segment, FrameError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header[..]).await?;

        let carried_header_crc = (&header[3..]).get_u32_le();
        let computed_header_crc = crc32c::crc32c(&header[..3]);
        if carried_header_crc != computed_header_crc {
            return Err(FrameError::SegmentChecksumMismatch {
                computed: computed_header_crc,
                carried: carried_header_crc,
            });
        }

        let header_word = u32::from_le_bytes([header[0], header[1], header[2], 0]);
        let payload_len = (header_word & (SELF_CONTAINED_BIT - 1)) as usize;
        let self_contained = header_word & SELF_CONTAINED_BIT != 0;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload[..]).await?;

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer[..]).await?;
        let carried_payload_crc = u32::from_le_bytes(trailer);
        let computed_payload_crc = crc32c::crc32c(&payload);
        if carried_payload_crc != computed_payload_crc {
            return Err(FrameError::SegmentChecksumMismatch {
                computed: computed_payload_crc,
                carried: carried_payload_crc,
            });
        }

        Ok(Segment {
            self_contained,
            payload,
        })
    }
}

/// Splits a serialized frame into segments ready to be written to a v5 stream.
///
/// A frame short enough to fit one segment becomes a single self-contained
/// segment; larger frames are sliced into non-self-contained segments.
pub fn segment_frame(frame_data: &[u8]) -> impl Iterator<Item = Segment> + '_ {
    let self_contained = frame_data.len() <= MAX_SEGMENT_PAYLOAD;
    frame_data
        .chunks(MAX_SEGMENT_PAYLOAD)
        .map(move |chunk| Segment::new(self_contained, chunk.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn segment_round_trip() {
        let segment = Segment::new(true, b"\x85\x00\x00\x01\x02\x00\x00\x00\x00".to_vec());
        let mut wire = Vec::new();
        segment.serialize(&mut wire).unwrap();
        let decoded = Segment::read(&mut &wire[..]).await.unwrap();
        assert_eq!(decoded, segment);
    }

    #[tokio::test]
    async fn corrupted_payload_is_detected() {
        let segment = Segment::new(true, vec![7u8; 64]);
        let mut wire = Vec::new();
        segment.serialize(&mut wire).unwrap();
        // Flip a bit in the middle of the payload.
        wire[HEADER_SIZE + 10] ^= 0x01;
        let err = Segment::read(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::SegmentChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn corrupted_header_is_detected() {
        let segment = Segment::new(false, vec![1u8; 8]);
        let mut wire = Vec::new();
        segment.serialize(&mut wire).unwrap();
        wire[0] ^= 0x80;
        let err = Segment::read(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::SegmentChecksumMismatch { .. }));
    }

    #[test]
    fn oversized_frame_is_sliced() {
        let frame = vec![0u8; MAX_SEGMENT_PAYLOAD + 10];
        let segments: Vec<_> = segment_frame(&frame).collect();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| !s.self_contained));
        assert_eq!(
            segments.iter().map(|s| s.payload.len()).sum::<usize>(),
            frame.len()
        );
    }

    #[test]
    fn payload_over_limit_is_rejected() {
        let segment = Segment::new(true, vec![0u8; MAX_SEGMENT_PAYLOAD + 1]);
        let mut out = Vec::new();
        assert!(matches!(
            segment.serialize(&mut out),
            Err(FrameError::SegmentTooLarge(_))
        ));
    }
}
