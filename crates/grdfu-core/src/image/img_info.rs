//! Image descriptor (40 bytes) as stored in the SCA image list and in file trailers.

use super::boot_info::BootInfo;
use crate::codec::{CodecError, HexCursor};

/// Marks a valid image descriptor slot.
pub const IMG_INFO_PATTERN: u16 = 0x4744;

const COMMENTS_SIZE: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImgInfo {
    pub pattern: u16,
    pub version: u16,
    pub boot_info: BootInfo,
    pub comments: String,
}

impl ImgInfo {
    pub const SIZE: usize = 2 + 2 + BootInfo::SIZE + COMMENTS_SIZE;

    /// Descriptor for an image known only from the running boot information.
    pub fn from_boot(boot_info: BootInfo) -> Self {
        Self {
            pattern: IMG_INFO_PATTERN,
            version: 1,
            boot_info,
            comments: "fromBoot".to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pattern == IMG_INFO_PATTERN
    }

    pub fn read_from(cursor: &mut HexCursor) -> Self {
        let pattern = cursor.get_u16();
        let version = cursor.get_u16();
        let boot_info = BootInfo::read_from(cursor);
        let comments = cursor.get_cstring(COMMENTS_SIZE);
        Self {
            pattern,
            version,
            boot_info,
            comments,
        }
    }

    pub fn write_to(&self, cursor: &mut HexCursor) -> Result<(), CodecError> {
        cursor.put_u16(self.pattern)?.put_u16(self.version)?;
        self.boot_info.write_to(cursor)?;
        cursor.put_ascii(COMMENTS_SIZE, &self.comments)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut cursor = HexCursor::new(Self::SIZE);
        self.write_to(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImgInfo {
        ImgInfo {
            pattern: IMG_INFO_PATTERN,
            version: 0x0102,
            boot_info: BootInfo {
                bin_size: 0x0002_0000,
                checksum: 0x00AB_CDEF,
                load_addr: 0x0104_0000,
                run_addr: 0x0104_0000,
                xqspi_xip_cmd: 0xEB,
                xqspi_speed: 3,
                code_copy_mode: 1,
                system_clk: 2,
                check_image: 1,
                boot_delay: 0,
                is_dap_boot: 1,
            },
            comments: "ble_app".to_string(),
        }
    }

    #[test]
    fn test_img_info_roundtrip() {
        let info = sample();
        let bytes = info.to_bytes().unwrap();
        assert_eq!(bytes.len(), ImgInfo::SIZE);
        assert_eq!(&bytes[..2], &[0x44, 0x47]);

        let parsed = ImgInfo::read_from(&mut HexCursor::from_vec(bytes));
        assert_eq!(parsed, info);
        assert!(parsed.is_valid());
    }

    #[test]
    fn test_long_comment_is_truncated() {
        let mut info = sample();
        info.comments = "a-very-long-comment".to_string();
        let bytes = info.to_bytes().unwrap();
        let parsed = ImgInfo::read_from(&mut HexCursor::from_vec(bytes));
        assert_eq!(parsed.comments, "a-very-long-");
    }

    #[test]
    fn test_from_boot() {
        let info = ImgInfo::from_boot(sample().boot_info);
        assert!(info.is_valid());
        assert_eq!(info.version, 1);
        assert_eq!(info.comments, "fromBoot");
    }

    #[test]
    fn test_erased_slot_is_invalid() {
        let parsed = ImgInfo::read_from(&mut HexCursor::from_vec(vec![0xFF; ImgInfo::SIZE]));
        assert!(!parsed.is_valid());
        assert_eq!(parsed.comments, "");
    }
}
