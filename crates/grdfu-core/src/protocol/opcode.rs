//! Opcodes and device-reported status codes.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// Legacy / AppBootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    GetInfo = 0x01,
    Reset = 0x02,
    WriteRam = 0x11,
    ReadRam = 0x12,
    DumpFlash = 0x21,
    EraseFlash = 0x22,
    ProgramStart = 0x23,
    ProgramFlash = 0x24,
    ProgramEnd = 0x25,
    UpdateFlash = 0x26,
    SystemConfig = 0x27,
    OperationNvds = 0x28,
    RwEfuse = 0x29,
    ConfigExtFlash = 0x2A,
    GetFlashInfo = 0x2B,
    RwReg = 0x2C,
    SetDfuMode = 0x41,
    GetFwInfo = 0x42,
    ProgramFlashFast = 0xFF,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, u16::from(*self))
    }
}

/// FastDfu command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FastOpcode {
    EraseFlash = 0x01,
    FlushFlash = 0x02,
    VerifyChecksum = 0x03,
    WriteBoot = 0x04,
    SelectFlashType = 0x05,
    FlowCtrlPause = 0x06,
    FlowCtrlResume = 0x07,
    StartCopy = 0x08,
    GetBufferSize = 0x09,
    NextBuffer = 0x0A,
    GetVersion = 0x0B,
}

impl fmt::Display for FastOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, u8::from(*self))
    }
}

/// Erase phase reported while the device erases flash sectors.
///
/// Shared by the fast-mode `PROGRAM_START` exchange and FastDfu `ERASE_FLASH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EraseState {
    NotAligned = 0x00,
    Started = 0x01,
    Erasing = 0x02,
    Completed = 0x03,
    OverlapRunningFirmware = 0x04,
    Failed = 0x05,
    /// Legacy: area does not exist. FastDfu: no external flash attached.
    NoFlashArea = 0x06,
}

impl fmt::Display for EraseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EraseState::NotAligned => "Erase region is not aligned to 4K",
            EraseState::Started => "Erase started",
            EraseState::Erasing => "Erasing",
            EraseState::Completed => "Erase completed",
            EraseState::OverlapRunningFirmware => {
                "Erase region overlaps with the running firmware"
            }
            EraseState::Failed => "Erase flash failed",
            EraseState::NoFlashArea => "Erase region does not exist",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(u16::from(Opcode::ProgramStart), 0x23);
        assert_eq!(Opcode::try_from(0x42u16).unwrap(), Opcode::GetFwInfo);
        assert_eq!(Opcode::try_from(0xFFu16).unwrap(), Opcode::ProgramFlashFast);
        assert!(Opcode::try_from(0x30u16).is_err());
    }

    #[test]
    fn test_fast_opcode_values() {
        assert_eq!(u8::from(FastOpcode::GetVersion), 0x0B);
        assert_eq!(FastOpcode::try_from(0x0Au8).unwrap(), FastOpcode::NextBuffer);
        assert!(FastOpcode::try_from(0x0Cu8).is_err());
    }

    #[test]
    fn test_erase_state_display() {
        assert_eq!(EraseState::try_from(3u8).unwrap(), EraseState::Completed);
        assert!(EraseState::try_from(7u8).is_err());
        assert_eq!(
            EraseState::NotAligned.to_string(),
            "Erase region is not aligned to 4K"
        );
        assert_eq!(Opcode::SetDfuMode.to_string(), "SetDfuMode(0x41)");
    }
}
