//! Legacy / AppBootloader command frames.
//!
//! ```text
//! u16 magic (0x4744) | u16 opcode | u16 paramLen | params | u16 checksum
//! ```
//!
//! The checksum is the low 16 bits of the additive sum over
//! `opcode..params`.

use super::constants::{FRAME_CHECKSUM_SIZE, FRAME_HEADER_SIZE, FRAME_MAGIC};
use crate::codec::{CodecError, HexCursor};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Invalid magic: expected 0x{expected:04X}, got 0x{actual:04X}")]
    InvalidMagic { expected: u16, actual: u16 },

    #[error("Parameters too long: {0} bytes")]
    ParamsTooLong(usize),

    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u16,
    pub param_len: u16,
}

impl FrameHeader {
    pub const SIZE: usize = FRAME_HEADER_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < Self::SIZE {
            return Err(FrameError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = HexCursor::from_slice(&data[..Self::SIZE]);
        let magic = cursor.get_u16();
        if magic != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: FRAME_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            opcode: cursor.get_u16(),
            param_len: cursor.get_u16(),
        })
    }

    /// Size of the complete frame this header announces.
    pub fn frame_len(&self) -> usize {
        Self::SIZE + usize::from(self.param_len) + FRAME_CHECKSUM_SIZE
    }
}

pub fn encode_frame(opcode: u16, params: &[u8]) -> Result<Vec<u8>, FrameError> {
    let param_len =
        u16::try_from(params.len()).map_err(|_| FrameError::ParamsTooLong(params.len()))?;
    let mut cursor = HexCursor::new(FRAME_HEADER_SIZE + params.len() + FRAME_CHECKSUM_SIZE);
    cursor
        .put_u16(FRAME_MAGIC)?
        .put_u16(opcode)?
        .put_u16(param_len)?
        .put_bytes(params)?;
    let checksum = cursor.checksum(2, 4 + params.len());
    cursor.put_u16(checksum as u16)?;
    Ok(cursor.into_inner())
}

/// Splits a complete frame into its header and parameters, verifying the checksum.
pub fn decode_frame(data: &[u8]) -> Result<(FrameHeader, Vec<u8>), FrameError> {
    let header = FrameHeader::from_bytes(data)?;
    if data.len() < header.frame_len() {
        return Err(FrameError::BufferTooSmall {
            expected: header.frame_len(),
            actual: data.len(),
        });
    }
    let mut cursor = HexCursor::from_slice(&data[..header.frame_len()]);
    let params_end = FrameHeader::SIZE + usize::from(header.param_len);
    let expected = cursor.checksum(2, params_end - 2) as u16;
    cursor.set_pos(params_end);
    let actual = cursor.get_u16();
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    Ok((header, data[FrameHeader::SIZE..params_end].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;

    #[test]
    fn test_encode_get_info() {
        let frame = encode_frame(Opcode::GetInfo.into(), &[]).unwrap();
        assert_eq!(frame, vec![0x44, 0x47, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_checksum_truncated_to_16_bits() {
        let params = vec![0xFF; 300];
        let frame = encode_frame(Opcode::ProgramFlash.into(), &params).unwrap();
        let sum: u32 = 0x24 + 300 / 256 + 300 % 256 + 0xFF * 300;
        let tail = &frame[frame.len() - 2..];
        assert_eq!(u16::from_le_bytes([tail[0], tail[1]]), sum as u16);
    }

    #[test]
    fn test_decode_roundtrip() {
        let frame = encode_frame(Opcode::SystemConfig.into(), &[0, 1, 2, 3]).unwrap();
        let (header, params) = decode_frame(&frame).unwrap();
        assert_eq!(header.opcode, 0x27);
        assert_eq!(header.param_len, 4);
        assert_eq!(header.frame_len(), frame.len());
        assert_eq!(params, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let mut frame = encode_frame(Opcode::GetInfo.into(), &[9]).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            FrameHeader::from_bytes(&[0x45, 0x47, 0, 0, 0, 0]),
            Err(FrameError::InvalidMagic { actual: 0x4745, .. })
        ));
        assert!(matches!(
            FrameHeader::from_bytes(&[0x44]),
            Err(FrameError::BufferTooSmall { .. })
        ));
    }
}
