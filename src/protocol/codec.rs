//! Protocol codec for encoding/decoding frames
//!
//! Handles header packing and exact-length framing over streaming transports.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

use super::{flags, HEADER_SIZE, PROTOCOL_VERSION};

/// Default upper bound on payloads accepted by [`FrameDecoder`] (64 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Scratch size for payload reads in [`decode`]
const READ_CHUNK: usize = 4096;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload length mismatch: header declares {expected} bytes, payload has {actual}")]
    FrameLengthMismatch { expected: usize, actual: usize },

    #[error("{field} {value} does not fit in {bits} bits")]
    FieldOverflow { field: Field, value: u64, bits: u32 },

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Connection closed mid-frame")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Header field named in a [`CodecError::FieldOverflow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Method,
    Length,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Method => f.write_str("method"),
            Field::Length => f.write_str("length"),
        }
    }
}

/// Bit widths of (method, length) for the given flags
fn field_widths(flags: u8) -> (u32, u32) {
    if flags::is_wide_length(flags) {
        (16, 32)
    } else {
        (32, 16)
    }
}

fn check_width(field: Field, value: u64, bits: u32) -> Result<(), CodecError> {
    let max = (1u64 << bits) - 1;
    if value > max {
        return Err(CodecError::FieldOverflow { field, value, bits });
    }
    Ok(())
}

/// Fixed 8-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub method: u32,
    pub length: u32,
}

impl Header {
    /// Build a header for the current protocol version, checking that method
    /// and length fit the layout selected by `flags`.
    pub fn new(flags: u8, method: u32, length: usize) -> Result<Self, CodecError> {
        let (method_bits, length_bits) = field_widths(flags);
        check_width(Field::Method, u64::from(method), method_bits)?;
        check_width(Field::Length, length as u64, length_bits)?;

        Ok(Self {
            version: PROTOCOL_VERSION,
            flags,
            method,
            length: length as u32,
        })
    }

    /// Pack the header (big-endian).
    ///
    /// Fields are truncated to their wire widths; [`Header::new`] is the
    /// place where widths get validated.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.flags;
        if flags::is_wide_length(self.flags) {
            buf[2..4].copy_from_slice(&(self.method as u16).to_be_bytes());
            buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        } else {
            buf[2..4].copy_from_slice(&(self.length as u16).to_be_bytes());
            buf[4..8].copy_from_slice(&self.method.to_be_bytes());
        }
        buf
    }

    /// Unpack a header. Every bit pattern is a valid header; version
    /// mismatches are left to the application.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Self {
        let short = u32::from(u16::from_be_bytes([buf[2], buf[3]]));
        let long = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let (method, length) = if flags::is_wide_length(buf[1]) {
            (short, long)
        } else {
            (long, short)
        };

        Self {
            version: buf[0],
            flags: buf[1],
            method,
            length,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }
}

/// One complete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version of the sender
    pub version: u8,
    /// Raw flags byte, reserved bits included
    pub flags: u8,
    /// Method identifier used for routing
    pub method: u32,
    /// Payload length, always equal to `payload.len()`
    pub length: u32,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    fn from_parts(header: Header, payload: Bytes) -> Self {
        debug_assert_eq!(header.payload_len(), payload.len());
        Self {
            version: header.version,
            flags: header.flags,
            method: header.method,
            length: header.length,
            payload,
        }
    }

    /// The header this frame was decoded from
    pub fn header(&self) -> Header {
        Header {
            version: self.version,
            flags: self.flags,
            method: self.method,
            length: self.length,
        }
    }

    pub fn is_wide_length(&self) -> bool {
        flags::is_wide_length(self.flags)
    }
}

/// A message staged for sending on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub flags: u8,
    /// Declared payload length; checked against `payload` at encode time
    pub length: usize,
    pub method: u32,
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Create a message whose declared length matches its payload
    pub fn new(flags: u8, method: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            flags,
            length: payload.len(),
            method,
            payload,
        }
    }

    /// Encode into a complete frame
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(self.flags, self.length, self.method, &self.payload)
    }
}

/// Encode a frame into a freshly allocated buffer
pub fn encode(flags: u8, length: usize, method: u32, payload: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_into(flags, length, method, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame, appending header and payload to `buf`.
///
/// Nothing is written when an error is returned.
pub fn encode_into(
    flags: u8,
    length: usize,
    method: u32,
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    if payload.len() != length {
        return Err(CodecError::FrameLengthMismatch {
            expected: length,
            actual: payload.len(),
        });
    }

    let header = Header::new(flags, method, length)?;

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(())
}

/// Read exactly one frame from a byte source.
///
/// Returns `Ok(None)` when the source ends before a full header arrived (a
/// clean close) and `Err(CodecError::ConnectionClosed)` when it ends inside
/// the payload. Short reads are accumulated. On a non-blocking source a
/// `WouldBlock` surfaces as `CodecError::Io`, so only call this after the
/// multiplexer reported read readiness.
pub fn decode<R: Read + ?Sized>(source: &mut R) -> Result<Option<Frame>, CodecError> {
    let mut raw = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match source.read(&mut raw[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let header = Header::parse(&raw);
    let length = header.payload_len();

    let mut payload = BytesMut::with_capacity(length.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() < length {
        let want = (length - payload.len()).min(READ_CHUNK);
        match source.read(&mut chunk[..want]) {
            Ok(0) => return Err(CodecError::ConnectionClosed),
            Ok(n) => payload.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Some(Frame::from_parts(header, payload.freeze())))
}

/// Decodes frames out of a growing read buffer
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodeState {
    #[default]
    Header,
    Payload(Header),
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_frame_size,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let mut raw = [0u8; HEADER_SIZE];
                    raw.copy_from_slice(&buf[..HEADER_SIZE]);
                    let header = Header::parse(&raw);

                    if header.payload_len() > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(
                            header.payload_len(),
                            self.max_frame_size,
                        ));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Payload(header);
                }
                DecodeState::Payload(header) => {
                    // Buffer growth is left to the reader; a header alone
                    // must not commit memory for the declared length.
                    if buf.len() < header.payload_len() {
                        return Ok(None);
                    }

                    let payload = buf.split_to(header.payload_len()).freeze();
                    self.state = DecodeState::Header;

                    return Ok(Some(Frame::from_parts(header, payload)));
                }
            }
        }
    }

    /// Whether a frame has been started but not finished, counting bytes
    /// still sitting in `buf`.
    pub fn is_mid_frame(&self, buf: &BytesMut) -> bool {
        matches!(self.state, DecodeState::Payload(_)) || !buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Byte source that hands out pre-split chunks, then reports EOF
    struct ChunkedSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkedSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Read for ChunkedSource {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.chunks.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(out.len());
            out[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for (flags, method, payload) in [
            (0x00u8, 0u32, &b"zafflins"[..]),
            (0x01, 65_535, &b"{\"players\":{}}"[..]),
            (0x00, 4_000_000_000, &b""[..]),
        ] {
            let bytes = encode(flags, payload.len(), method, payload).unwrap();
            assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

            let frame = decode(&mut &bytes[..]).unwrap().unwrap();
            assert_eq!(frame.version, PROTOCOL_VERSION);
            assert_eq!(frame.flags, flags);
            assert_eq!(frame.method, method);
            assert_eq!(frame.length as usize, payload.len());
            assert_eq!(&frame.payload[..], payload);
        }
    }

    #[test]
    fn test_header_layout_follows_flag() {
        let wide = Header::new(flags::WIDE_LENGTH, 0x0102, 0x0304_0506).unwrap();
        assert_eq!(wide.encode(), [1, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

        let narrow = Header::new(0x00, 0x0304_0506, 0x0102).unwrap();
        assert_eq!(narrow.encode(), [1, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_reserved_flag_bits_pass_through() {
        let bytes = encode(0xA5, 3, 9, b"abc").unwrap();
        let frame = decode(&mut &bytes[..]).unwrap().unwrap();
        assert_eq!(frame.flags, 0xA5);
        assert_eq!(frame.flags & flags::RESERVED_MASK, 0xA4);
        assert!(frame.is_wide_length());
        assert_eq!(frame.method, 9);
    }

    #[test]
    fn test_width_branch_selection() {
        let header = Header::new(flags::WIDE_LENGTH, 40_000, 300_000_000).unwrap();
        assert_eq!(header.method, 40_000);
        assert_eq!(header.length, 300_000_000);

        // Same fields without the flag: the length only gets 16 bits.
        match Header::new(0x00, 40_000, 300_000_000) {
            Err(CodecError::FieldOverflow { field: Field::Length, bits: 16, .. }) => {}
            other => panic!("expected length overflow, got {:?}", other),
        }

        // With the flag set the method only gets 16 bits.
        match encode(flags::WIDE_LENGTH, 2, 70_000, b"hi") {
            Err(CodecError::FieldOverflow { field: Field::Method, value: 70_000, bits: 16 }) => {}
            other => panic!("expected method overflow, got {:?}", other),
        }
        assert!(encode(0x00, 2, 70_000, b"hi").is_ok());
    }

    #[test]
    fn test_length_mismatch() {
        match encode(0x00, 5, 1, b"ab") {
            Err(CodecError::FrameLengthMismatch { expected: 5, actual: 2 }) => {}
            other => panic!("expected length mismatch, got {:?}", other),
        }

        let mut buf = BytesMut::new();
        assert!(encode_into(0x00, 5, 1, b"ab", &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_payload_matches_single_read() {
        let payload: Vec<u8> = (0..100u8).collect();
        let bytes = encode(0x00, payload.len(), 7, &payload).unwrap();

        let whole = decode(&mut &bytes[..]).unwrap().unwrap();

        let (header, body) = bytes.split_at(HEADER_SIZE);
        let mut source = ChunkedSource::new(vec![
            header.to_vec(),
            body[..13].to_vec(),
            body[13..71].to_vec(),
            body[71..].to_vec(),
        ]);
        let split = decode(&mut source).unwrap().unwrap();

        assert_eq!(whole, split);
    }

    #[test]
    fn test_split_header_is_accumulated() {
        let bytes = encode(0x00, 4, 2, b"ping").unwrap();
        let mut source = ChunkedSource::new(vec![
            bytes[..3].to_vec(),
            bytes[3..8].to_vec(),
            bytes[8..].to_vec(),
        ]);
        let frame = decode(&mut source).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"ping");
    }

    #[test]
    fn test_mid_frame_close() {
        let bytes = encode(0x00, 10, 3, b"0123456789").unwrap();
        let mut source = ChunkedSource::new(vec![bytes[..HEADER_SIZE + 4].to_vec()]);

        assert!(matches!(decode(&mut source), Err(CodecError::ConnectionClosed)));
    }

    #[test]
    fn test_short_header_is_clean_close() {
        let mut empty = ChunkedSource::new(vec![]);
        assert!(decode(&mut empty).unwrap().is_none());

        let mut partial = ChunkedSource::new(vec![vec![1, 0, 0]]);
        assert!(decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_frame_decoder_byte_at_a_time() {
        let bytes = encode(flags::WIDE_LENGTH, 5, 12, b"hello").unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = decoder.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none());
                assert!(decoder.is_mid_frame(&buf));
            } else {
                let frame = decoded.unwrap();
                assert_eq!(frame.method, 12);
                assert_eq!(&frame.payload[..], b"hello");
            }
        }
        assert!(!decoder.is_mid_frame(&buf));
    }

    #[test]
    fn test_frame_decoder_multiple_frames() {
        let mut buf = BytesMut::new();
        for method in 0..3u32 {
            encode_into(0x00, 1, method, &[method as u8], &mut buf).unwrap();
        }

        let mut decoder = FrameDecoder::new();
        for method in 0..3u32 {
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.method, method);
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_decoder_rejects_oversized() {
        let header = Header::new(flags::WIDE_LENGTH, 1, 1024).unwrap();
        let mut buf = BytesMut::from(&header.encode()[..]);

        let mut decoder = FrameDecoder::with_max_frame_size(512);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::FrameTooLarge(1024, 512))
        ));
    }

    #[test]
    fn test_frame_decoder_header_does_not_preallocate() {
        let header = Header::new(flags::WIDE_LENGTH, 1, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::from(&header.encode()[..]);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_mid_frame(&buf));
        assert!(buf.capacity() <= READ_CHUNK);
    }

    #[test]
    fn test_outbound_message_encode() {
        let msg = OutboundMessage::new(0x01, 1, &b"{}"[..]);
        assert_eq!(msg.length, 2);
        let bytes = msg.encode().unwrap();
        let frame = decode(&mut &bytes[..]).unwrap().unwrap();
        assert_eq!(frame.header(), Header::new(0x01, 1, 2).unwrap());
    }
}
