/* How a transfer works
 * --------------------
 * Every datagram is a FRAME:
 * Length: 2 bytes unsigned integer; size of the payload that follows the header
 * Frame type: 1 byte; bit flags, see `frame_type`
 * Checksum: 32 bytes; SHA-256 over the header (with this field zeroed) and the payload
 * Payload: `Length` bytes
 *
 * The client opens a transfer with an INITIATE frame carrying a REQUEST:
 * Tag: 1 byte; RequestTag
 * Requested buffer size: 4 bytes unsigned integer; largest chunk the client accepts (0 = server default)
 * Request id: 1 byte; distinguishes transfers from the same peer
 * Path: the rest of the payload; at most MAX_PATH_LEN bytes, relative to the served root
 *
 * The server answers with one or more frames carrying a RESPONSE:
 * Tag: 1 byte; ResponseTag
 * Length: 4 bytes unsigned integer
 * Sequence: 4 bytes unsigned integer; 0 for the first response of a transfer, then +1
 * Data: `Length` bytes
 * The first response frame is flagged FIRST, the rest CONNECTED.
 *
 * Exactly one TERM closes a successful transfer and it carries the highest sequence.
 * An ERR closes a failed one; its data is the error text.
 *
 * Nothing acknowledges a chunk. If the client hears nothing before its deadline it sends the
 * identical request again; a server that already finished that request replays only its
 * last response.
 */

use crate::error::WireError;

// Largest UDP payload over IPv4.
pub const MAX_FRAME_SIZE: usize = 65_507;
pub const CHECKSUM_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 2 + 1 + CHECKSUM_SIZE;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

pub const REQUEST_HEADER_SIZE: usize = 6;
pub const RESPONSE_HEADER_SIZE: usize = 9;
pub const MAX_PATH_LEN: usize = 2048;
pub const MAX_RESPONSE_DATA: usize = 65_536;

/// Largest chunk that fits in a single response frame.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD_SIZE - RESPONSE_HEADER_SIZE;

/// Bit flags carried in the frame header's type byte.
pub mod frame_type {
    /// Client opening (or re-sending) a request.
    pub const INITIATE: u8 = 1;
    /// First response of a transfer.
    pub const FIRST: u8 = 1 << 1;
    /// Any later response of a transfer.
    pub const CONNECTED: u8 = 1 << 2;
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTag {
    /// List a whole directory.
    Ls = 1,
    /// List one page of a directory.
    Entry = 2,
    /// Get the first chunk of a file.
    Chunk = 3,
    /// Get the whole file.
    Get = 4,
}

impl RequestTag {
    pub fn is_directory_op(self) -> bool {
        matches!(self, RequestTag::Ls | RequestTag::Entry)
    }
}

impl TryFrom<u8> for RequestTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RequestTag::Ls),
            2 => Ok(RequestTag::Entry),
            3 => Ok(RequestTag::Chunk),
            4 => Ok(RequestTag::Get),
            other => Err(WireError::InvalidTag(other)),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseTag {
    /// One directory entry name.
    LsEntry = 15,
    /// A non-final chunk.
    Chunk = 16,
    /// The final chunk of a transfer.
    Term = 17,
    /// The transfer failed; data holds the reason.
    Err = 18,
}

impl TryFrom<u8> for ResponseTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            15 => Ok(ResponseTag::LsEntry),
            16 => Ok(ResponseTag::Chunk),
            17 => Ok(ResponseTag::Term),
            18 => Ok(ResponseTag::Err),
            other => Err(WireError::InvalidTag(other)),
        }
    }
}
