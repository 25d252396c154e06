//! Boot descriptor (24 bytes) and address-range arithmetic.

use crate::codec::{CodecError, HexCursor};

/// Where an image loads and runs, plus packed boot configuration bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub bin_size: u32,
    pub checksum: u32,
    pub load_addr: u32,
    pub run_addr: u32,
    pub xqspi_xip_cmd: u32,
    /// Bits 0..=3 of the config word.
    pub xqspi_speed: u8,
    /// Bit 4.
    pub code_copy_mode: u8,
    /// Bits 5..=7.
    pub system_clk: u8,
    /// Bit 8.
    pub check_image: u8,
    /// Bit 9.
    pub boot_delay: u8,
    /// Bit 10.
    pub is_dap_boot: u8,
}

impl BootInfo {
    pub const SIZE: usize = 24;

    pub fn read_from(cursor: &mut HexCursor) -> Self {
        let mut info = Self {
            bin_size: cursor.get_u32(),
            checksum: cursor.get_u32(),
            load_addr: cursor.get_u32(),
            run_addr: cursor.get_u32(),
            xqspi_xip_cmd: cursor.get_u32(),
            ..Self::default()
        };
        info.set_config_word(cursor.get_u32());
        info
    }

    pub fn write_to(&self, cursor: &mut HexCursor) -> Result<(), CodecError> {
        cursor
            .put_u32(self.bin_size)?
            .put_u32(self.checksum)?
            .put_u32(self.load_addr)?
            .put_u32(self.run_addr)?
            .put_u32(self.xqspi_xip_cmd)?
            .put_u32(self.config_word())?;
        Ok(())
    }

    pub fn config_word(&self) -> u32 {
        u32::from(self.xqspi_speed & 0x0F)
            | u32::from(self.code_copy_mode & 0x01) << 4
            | u32::from(self.system_clk & 0x07) << 5
            | u32::from(self.check_image & 0x01) << 8
            | u32::from(self.boot_delay & 0x01) << 9
            | u32::from(self.is_dap_boot & 0x01) << 10
    }

    pub fn set_config_word(&mut self, word: u32) {
        self.xqspi_speed = (word & 0x0F) as u8;
        self.code_copy_mode = ((word >> 4) & 0x01) as u8;
        self.system_clk = ((word >> 5) & 0x07) as u8;
        self.check_image = ((word >> 8) & 0x01) as u8;
        self.boot_delay = ((word >> 9) & 0x01) as u8;
        self.is_dap_boot = ((word >> 10) & 0x01) as u8;
    }

    /// True when the image's flash range intersects `[addr, addr + size)`.
    pub fn overlaps(&self, addr: u32, size: u32) -> bool {
        has_overlap(self.load_addr, self.bin_size, addr, size)
    }
}

const ADDRESS_SPACE: u64 = 1 << 32;

/// Splits a range into at most two segments of the 32-bit address space.
fn segments(addr: u32, size: u32) -> [(u64, u64); 2] {
    let start = u64::from(addr);
    let end = start + u64::from(size);
    if end > ADDRESS_SPACE {
        [(start, ADDRESS_SPACE), (0, end - ADDRESS_SPACE)]
    } else {
        [(start, end), (0, 0)]
    }
}

/// Overlap test for two `[addr, addr + size)` ranges.
///
/// Sums are computed in 64 bits, and a range running past `0xFFFFFFFF`
/// continues from address zero. Empty ranges overlap nothing.
pub fn has_overlap(addr1: u32, size1: u32, addr2: u32, size2: u32) -> bool {
    let a = segments(addr1, size1);
    let b = segments(addr2, size2);
    a.iter()
        .any(|&(s1, e1)| b.iter().any(|&(s2, e2)| s1 < e2 && s2 < e1))
}
