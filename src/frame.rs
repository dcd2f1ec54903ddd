//! Wire frames: header, checksum and payload.
//!
//! Pure data transformation; no I/O happens here. This is the only place where
//! corruption, truncation or tampering of a datagram is detected, so everything
//! above it may assume a decoded [`Frame`] is well formed.
//!
//! ```text
//!  0       2    3                                35
//! +-------+----+---------------------------------+-----------------+
//! |  len  | ty |        checksum (SHA-256)       | payload (len)   |
//! +-------+----+---------------------------------+-----------------+
//! ```

use crypto_hash::{digest, Algorithm};

use crate::error::WireError;
use crate::protocol::{CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};

const OFF_LEN: usize = 0;
const OFF_TYPE: usize = 2;
const OFF_CHECKSUM: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub checksum: [u8; CHECKSUM_SIZE],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a datagram around `payload`.
    ///
    /// The checksum covers the header with its checksum field zeroed followed by
    /// the payload.
    pub fn encode(frame_type: u8, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
        buf[OFF_LEN..OFF_LEN + 2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[OFF_TYPE] = frame_type;
        buf[HEADER_SIZE..].copy_from_slice(payload);

        let hash = checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + CHECKSUM_SIZE].copy_from_slice(&hash);
        Ok(buf)
    }

    /// Validate a received datagram and copy its payload out.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }

        let len = u16::from_be_bytes([buf[OFF_LEN], buf[OFF_LEN + 1]]) as usize;
        if buf.len() - HEADER_SIZE != len {
            return Err(WireError::LengthMismatch);
        }

        let mut received = [0u8; CHECKSUM_SIZE];
        received.copy_from_slice(&buf[OFF_CHECKSUM..OFF_CHECKSUM + CHECKSUM_SIZE]);

        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + CHECKSUM_SIZE].fill(0);
        if checksum(&scratch) != received {
            return Err(WireError::ChecksumMismatch);
        }

        Ok(Frame {
            frame_type: buf[OFF_TYPE],
            checksum: received,
            payload: scratch.split_off(HEADER_SIZE),
        })
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.frame_type & flag == flag
    }
}

/// SHA-256 of `data`. The caller zeroes the checksum field first.
fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = digest(Algorithm::SHA256, data);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&hash);
    out
}
