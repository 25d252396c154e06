//! Errors raised by the DFU engines.

use thiserror::Error;

use crate::codec::CodecError;
use crate::image::FileError;
use crate::protocol::FrameError;
use crate::transport::TransportError;

/// Named flash region taking part in an overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub addr: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(name: &'static str, addr: u32, size: u32) -> Self {
        Self { name, addr, size }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = u64::from(self.addr) + u64::from(self.size);
        write!(f, "{}(0x{:08X}-0x{:08X})", self.name, self.addr, end)
    }
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Protocol(String),

    #[error("{src} overlaps {dst}")]
    Overlap { src: Region, dst: Region },

    #[error("Invalid file: {0}")]
    InvalidFile(#[from] FileError),

    #[error("Encryption is mismatch. FW = {firmware}, CHIP = {chip}")]
    EncryptionMismatch { firmware: bool, chip: bool },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl DfuError {
    pub fn protocol(message: impl Into<String>) -> Self {
        DfuError::Protocol(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DfuError::Transport(TransportError::Timeout { .. }))
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            DfuError::Transport(TransportError::ConnectionLost { .. })
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DfuError::Cancelled | DfuError::Transport(TransportError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, DfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_message() {
        let err = DfuError::Overlap {
            src: Region::new("DATA", 0x0100_0000, 0x1000),
            dst: Region::new("SCA", 0x0100_0000, 0x2000),
        };
        assert_eq!(
            err.to_string(),
            "DATA(0x01000000-0x01001000) overlaps SCA(0x01000000-0x01002000)"
        );
    }

    #[test]
    fn test_region_end_past_4g() {
        let region = Region::new("APP_NEW", 0xFFFF_F000, 0x2000);
        assert_eq!(region.to_string(), "APP_NEW(0xFFFFF000-0x100001000)");
    }

    #[test]
    fn test_classification() {
        let timeout: DfuError = TransportError::Timeout {
            op: "read",
            target: "x".into(),
            timeout_ms: 10,
        }
        .into();
        assert!(timeout.is_timeout());
        assert!(!timeout.is_connection_lost());

        let lost: DfuError = TransportError::ConnectionLost {
            op: "read",
            target: "x".into(),
        }
        .into();
        assert!(lost.is_connection_lost());

        assert!(DfuError::from(TransportError::Cancelled).is_cancelled());
        assert!(DfuError::Cancelled.is_cancelled());
        assert!(!DfuError::protocol("x").is_cancelled());
    }
}
