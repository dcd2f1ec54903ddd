//! Typed requests and responses carried inside a frame's payload.
//!
//! These codecs never touch the network. They operate on payload bytes the
//! frame layer has already validated.

use crate::error::WireError;
use crate::frame::Frame;
use crate::protocol::{
    frame_type, RequestTag, ResponseTag, MAX_PATH_LEN, MAX_RESPONSE_DATA, REQUEST_HEADER_SIZE,
    RESPONSE_HEADER_SIZE,
};

/// Client to server.
///
/// Path containment is checked by the daemon when the request arrives, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub tag: RequestTag,
    pub requested_buffer_size: u32,
    pub request_id: u8,
    pub path: String,
}

impl Request {
    pub fn new(tag: RequestTag, request_id: u8, requested_buffer_size: u32, path: impl Into<String>) -> Self {
        Self {
            tag,
            requested_buffer_size,
            request_id,
            path: path.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let path = self.path.as_bytes();
        if path.len() > MAX_PATH_LEN {
            return Err(WireError::PathTooLong(path.len()));
        }

        let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + path.len());
        buf.push(self.tag as u8);
        buf.extend_from_slice(&self.requested_buffer_size.to_be_bytes());
        buf.push(self.request_id);
        buf.extend_from_slice(path);
        Ok(buf)
    }

    /// The complete `INITIATE` datagram. Retransmissions reuse these exact bytes.
    pub fn to_datagram(&self) -> Result<Vec<u8>, WireError> {
        Frame::encode(frame_type::INITIATE, &self.encode()?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let tag = RequestTag::try_from(buf[0])?;
        let requested_buffer_size = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let request_id = buf[5];

        let path = &buf[REQUEST_HEADER_SIZE..];
        if path.len() > MAX_PATH_LEN {
            return Err(WireError::PathTooLong(path.len()));
        }

        Ok(Self {
            tag,
            requested_buffer_size,
            request_id,
            path: String::from_utf8_lossy(path).into_owned(),
        })
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub tag: ResponseTag,
    pub sequence: u32,
    pub data: Vec<u8>,
}

impl Response {
    pub fn new(tag: ResponseTag, sequence: u32, data: Vec<u8>) -> Self {
        Self { tag, sequence, data }
    }

    pub fn error(sequence: u32, message: &str) -> Self {
        Self::new(ResponseTag::Err, sequence, message.as_bytes().to_vec())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.tag, ResponseTag::Term | ResponseTag::Err)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_HEADER_SIZE + self.data.len());
        buf.push(self.tag as u8);
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Frame this response; the first of a transfer is flagged `FIRST`.
    pub fn to_datagram(&self) -> Result<Vec<u8>, WireError> {
        let flags = if self.sequence == 0 {
            frame_type::FIRST
        } else {
            frame_type::CONNECTED
        };
        Frame::encode(flags, &self.encode())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let tag = ResponseTag::try_from(buf[0])?;
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let sequence = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        if length > MAX_RESPONSE_DATA {
            return Err(WireError::PayloadTooLarge(length));
        }

        let data = &buf[RESPONSE_HEADER_SIZE..];
        if data.len() != length {
            return Err(WireError::LengthMismatch);
        }

        Ok(Self {
            tag,
            sequence,
            data: data.to_vec(),
        })
    }
}
