//! FastDfu command encoding.
//!
//! ```text
//! u32 magic (0x474F4F44) | u8 opcode | params
//! ```
//!
//! Acknowledgements arrive as single notifications starting with the opcode
//! they answer.

use super::constants::{FAST_CMD_HEADER_SIZE, FAST_CMD_MAGIC};
use super::opcode::FastOpcode;
use crate::codec::HexCursor;
use byteorder::{ByteOrder, LittleEndian};

/// A FastDfu command with a fixed-size parameter area.
#[derive(Debug, Clone)]
pub struct FastCmd {
    opcode: FastOpcode,
    cursor: HexCursor,
}

impl FastCmd {
    pub fn new(opcode: FastOpcode) -> Self {
        Self::with_params(opcode, 0)
    }

    pub fn with_params(opcode: FastOpcode, param_size: usize) -> Self {
        let mut buf = vec![0u8; FAST_CMD_HEADER_SIZE + param_size];
        LittleEndian::write_u32(&mut buf[..4], FAST_CMD_MAGIC);
        buf[4] = opcode.into();
        let mut cursor = HexCursor::from_vec(buf);
        cursor.set_pos(FAST_CMD_HEADER_SIZE);
        Self { opcode, cursor }
    }

    pub fn opcode(&self) -> FastOpcode {
        self.opcode
    }

    /// Parameter writer, positioned after the header.
    pub fn params(&mut self) -> &mut HexCursor {
        &mut self.cursor
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.cursor.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let cmd = FastCmd::new(FastOpcode::GetVersion);
        assert_eq!(cmd.as_bytes(), &[0x44, 0x4F, 0x4F, 0x47, 0x0B]);
    }

    #[test]
    fn test_params_follow_header() {
        let mut cmd = FastCmd::with_params(FastOpcode::EraseFlash, 8);
        cmd.params()
            .put_u32(0x0104_0000)
            .unwrap()
            .put_u32(0x2000)
            .unwrap();
        assert!(cmd.params().put_u8(0).is_err());
        let bytes = cmd.into_bytes();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[4], 0x01);
        assert_eq!(&bytes[5..9], &[0x00, 0x00, 0x04, 0x01]);
        assert_eq!(&bytes[9..13], &[0x00, 0x20, 0x00, 0x00]);
    }
}
