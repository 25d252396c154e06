//! DFU protocol engines.
//!
//! - [`LegacyDfu`]: framed command/response protocol on the legacy DFU
//!   service, covering both the v1 single-firmware layout and the v2
//!   AppBootloader layout.
//! - [`FastDfu`]: the streamlined CMD/DAT protocol.

pub mod fast;
pub mod legacy;
pub mod overlap;
pub mod profile;

use std::time::Duration;

pub use fast::{FastDfu, FastTarget};
pub use legacy::{
    AppBootloaderExtraInfo, ChipInfo, FirmwarePosition, ImgInfoList, LegacyDfu, StartupBootInfo,
};
pub use profile::{DfuProfile, ProtocolVersion};

use crate::protocol::constants::DFU_MAX_MTU;

/// What is written to flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// A firmware image carrying an image descriptor trailer.
    Firmware,
    /// Raw data, optionally destined for external flash.
    Resource { ext_flash: bool },
}

impl Payload {
    pub fn is_firmware(&self) -> bool {
        matches!(self, Payload::Firmware)
    }

    pub fn to_ext_flash(&self) -> bool {
        matches!(self, Payload::Resource { ext_flash: true })
    }
}

/// Delays and deadlines used by the engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTiming {
    /// Deadline of one legacy command exchange.
    pub legacy_cmd_timeout: Duration,
    /// Deadline of one FastDfu command exchange.
    pub fast_cmd_timeout: Duration,
    /// Scan window when looking for a rebooted device.
    pub scan_timeout: Duration,
    /// MTU requested after reconnecting.
    pub mtu: u16,
    /// SET_DFU_MODE has no response.
    pub dfu_mode_settle: Duration,
    pub before_jump_disconnect: Duration,
    pub after_jump_disconnect: Duration,
    /// Time given to a freshly started bootloader.
    pub bootloader_warmup: Duration,
    /// Pause between FLUSH_FLASH and VERIFY_CHECKSUM.
    pub flush_settle: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            legacy_cmd_timeout: Duration::from_millis(10_000),
            fast_cmd_timeout: Duration::from_millis(3_000),
            scan_timeout: Duration::from_millis(31_000),
            mtu: DFU_MAX_MTU,
            dfu_mode_settle: Duration::from_millis(500),
            before_jump_disconnect: Duration::from_millis(100),
            after_jump_disconnect: Duration::from_millis(200),
            bootloader_warmup: Duration::from_millis(2_000),
            flush_settle: Duration::from_millis(200),
        }
    }
}
