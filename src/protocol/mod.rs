//! Protocol module - Defines the wire protocol for NanoServe communication
//!
//! Every frame carries a fixed 8-byte big-endian header followed by the payload:
//! - 1 byte protocol version
//! - 1 byte flags
//! - 6 bytes holding the method and payload length
//!
//! Bit 0 of the flags selects how the last 6 bytes are split:
//! - set: method (u16), then length (u32) - large payloads, narrow method space
//! - clear: length (u16), then method (u32) - many methods, payloads up to 64 KiB

mod codec;

pub use codec::*;

/// Protocol version advertised in every encoded header
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for NanoServe communication
pub const DEFAULT_PORT: u16 = 5555;

/// Header size: version(1) + flags(1) + method/length(2) + length/method(4) = 8 bytes
pub const HEADER_SIZE: usize = 8;

/// Header flag bits
pub mod flags {
    /// Selects the wide-length layout: 16-bit method, 32-bit length.
    pub const WIDE_LENGTH: u8 = 0x01;

    /// Bits with no meaning yet. They are carried through encode and decode untouched.
    pub const RESERVED_MASK: u8 = !WIDE_LENGTH;

    /// Check whether the wide-length layout is selected.
    #[inline]
    pub fn is_wide_length(flags: u8) -> bool {
        flags & WIDE_LENGTH != 0
    }
}
