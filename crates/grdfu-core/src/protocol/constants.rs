//! Protocol constants of the GR5xxx DFU GATT profiles.

use uuid::Uuid;

// ============================================================================
// GATT identifiers
// ============================================================================

/// Legacy / AppBootloader DFU service.
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0xa6ed0401_d344_460a_8075_b9e8ec90d71b);
/// Device -> host responses (notify).
pub const DFU_NOTIFY_CHR_UUID: Uuid = Uuid::from_u128(0xa6ed0402_d344_460a_8075_b9e8ec90d71b);
/// Host -> device command frames.
pub const DFU_WRITE_CHR_UUID: Uuid = Uuid::from_u128(0xa6ed0403_d344_460a_8075_b9e8ec90d71b);
/// Control point; supports indicate on AppBootloader devices.
pub const DFU_CTRL_CHR_UUID: Uuid = Uuid::from_u128(0xa6ed0404_d344_460a_8075_b9e8ec90d71b);

pub const FAST_DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0xa6ed0701_d344_460a_8075_b9e8ec90d71b);
/// Commands and acknowledgements (notify).
pub const FAST_DFU_CMD_CHR_UUID: Uuid = Uuid::from_u128(0xa6ed0702_d344_460a_8075_b9e8ec90d71b);
/// Bulk image data.
pub const FAST_DFU_DAT_CHR_UUID: Uuid = Uuid::from_u128(0xa6ed0703_d344_460a_8075_b9e8ec90d71b);

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];
pub const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];
pub const CCCD_INDICATE: [u8; 2] = [0x02, 0x00];

// ============================================================================
// Link parameters
// ============================================================================

/// Default ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;
/// MTU requested for DFU; larger reports are clamped to it.
pub const DFU_MAX_MTU: u16 = 247;
/// ATT write header overhead.
pub const ATT_WRITE_OVERHEAD: u16 = 3;

// ============================================================================
// Legacy / AppBootloader framing
// ============================================================================

/// Frame magic, also the `ImgInfo` validity pattern.
pub const FRAME_MAGIC: u16 = 0x4744;
/// magic + opcode + length.
pub const FRAME_HEADER_SIZE: usize = 6;
pub const FRAME_CHECKSUM_SIZE: usize = 2;
/// Largest response frame accepted from the device.
pub const MAX_RESPONSE_FRAME: usize = 2048;
/// Response code reporting success.
pub const RESP_SUCCESS: u8 = 0x01;
/// Written to the control point to start DFU scheduling / jump to the boot firmware.
pub const CTRL_JUMP_PATTERN: [u8; 4] = [0x44, 0x4F, 0x4F, 0x47];

/// Bytes per classic `PROGRAM_FLASH` request.
pub const PROGRAM_SEGMENT_SIZE: usize = 1024;

// ============================================================================
// Flash layout
// ============================================================================

/// SCA of chips without a known stack SVN.
pub const DEFAULT_SCA_ADDR: u32 = 0x0020_0000;
/// SCA of GR551x family chips.
pub const GR551X_SCA_ADDR: u32 = 0x0100_0000;
/// Stack SVNs identifying GR551x family chips.
pub const GR551X_STACK_SVNS: &[u32] = &[0x1EA8, 0x0B88];
pub const SCA_SIZE: u32 = 0x2000;
/// Image descriptor list offset inside the SCA.
pub const IMG_LIST_OFFSET: u32 = 0x40;
pub const IMG_LIST_SLOTS: usize = 10;

/// `SYSTEM_CONFIG` operation codes.
pub const SYSTEM_CONFIG_READ: u8 = 0x00;
pub const SYSTEM_CONFIG_WRITE: u8 = 0x01;

// ============================================================================
// FastDfu framing
// ============================================================================

/// "DOOG", little-endian on the wire.
pub const FAST_CMD_MAGIC: u32 = 0x474F_4F44;
pub const FAST_CMD_HEADER_SIZE: usize = 5;
pub const FAST_FLASH_SECTOR_SIZE: u32 = 4096;
/// Device buffer size from protocol version 3 on.
pub const FAST_DEFAULT_BUFFER_SIZE: u32 = 4096;
