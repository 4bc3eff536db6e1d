//! Record framing.
//!
//! Frame layout (little endian):
//!
//! ```text
//! | magic (4) | length (4) | payload (length) | crc32 (4) |
//! ```
//!
//! The CRC covers magic, length and payload.

use crate::error::{StorageError, StorageResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SSLR";

/// Bytes added around each payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;

const HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// Result of scanning a byte buffer for frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedFrames {
    /// Payloads of every intact frame, in order.
    pub records: Vec<Vec<u8>>,
    /// Length of the prefix made of intact frames.
    ///
    /// Anything past this offset is a torn trailing write.
    pub valid_len: u64,
}

impl DecodedFrames {
    /// Returns true if the buffer ended with a partial frame.
    pub fn has_torn_tail(&self, total_len: u64) -> bool {
        self.valid_len < total_len
    }
}

/// Wraps a payload in a frame.
///
/// # Errors
///
/// Returns [`StorageError::PayloadTooLarge`] if the payload length does not
/// fit the 4-byte length field.
pub fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::PayloadTooLarge { len: payload.len() })?;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Splits a buffer into frame payloads.
///
/// A short or checksum-failing frame at the very end of the buffer is
/// treated as a torn write and excluded from `valid_len`. The same damage
/// anywhere else means the log was corrupted.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] for damage before the final frame.
pub fn decode_frames(bytes: &[u8]) -> StorageResult<DecodedFrames> {
    let total = bytes.len();
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < total {
        let remaining = total - offset;
        if remaining < HEADER_SIZE {
            break;
        }

        if bytes[offset..offset + 4] != FRAME_MAGIC {
            return Err(StorageError::corrupted(offset as u64, "bad frame magic"));
        }

        let len = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;

        let payload_end = offset + HEADER_SIZE + len;
        let frame_end = payload_end + CRC_SIZE;
        if frame_end > total {
            break;
        }

        let stored_crc = u32::from_le_bytes([
            bytes[payload_end],
            bytes[payload_end + 1],
            bytes[payload_end + 2],
            bytes[payload_end + 3],
        ]);
        let computed_crc = compute_crc32(&bytes[offset..payload_end]);

        if stored_crc != computed_crc {
            if frame_end == total {
                break;
            }
            return Err(StorageError::corrupted(
                offset as u64,
                format!("checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
            ));
        }

        records.push(bytes[offset + HEADER_SIZE..payload_end].to_vec());
        offset = frame_end;
    }

    Ok(DecodedFrames {
        records,
        valid_len: offset as u64,
    })
}

/// Computes a CRC32 (IEEE polynomial) checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
