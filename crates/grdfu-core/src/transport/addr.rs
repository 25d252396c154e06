//! Bluetooth device address.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid device address {input:?}: expected 12 hex digits, found {digits}")]
pub struct ParseAddrError {
    input: String,
    digits: usize,
}

/// 48-bit device address, most significant octet first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[2..]);
        Self(octets)
    }

    /// Same address with `delta` added to the last octet, wrapping within it.
    ///
    /// AppBootloader firmware advertises at the application's address plus one.
    pub fn with_last_octet_offset(&self, delta: u8) -> Self {
        let mut octets = self.0;
        octets[5] = octets[5].wrapping_add(delta);
        Self(octets)
    }
}

impl FromStr for BdAddr {
    type Err = ParseAddrError;

    /// Accepts any separators; only hex digits are significant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .chars()
            .filter_map(|c| c.to_digit(16))
            .map(|d| d as u8)
            .collect();
        if digits.len() != 12 {
            return Err(ParseAddrError {
                input: s.to_string(),
                digits: digits.len(),
            });
        }
        let mut octets = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            octets[i] = (pair[0] << 4) | pair[1];
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: BdAddr = "c0:1a-2B 3c:4D:5e".parse().unwrap();
        assert_eq!(addr.octets(), [0xC0, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
        assert_eq!(addr.to_string(), "C0:1A:2B:3C:4D:5E");
        assert_eq!(addr.to_u64(), 0xC01A_2B3C_4D5E);
        assert_eq!(BdAddr::from_u64(0xC01A_2B3C_4D5E), addr);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!("C0:1A:2B".parse::<BdAddr>().is_err());
        assert!("C0:1A:2B:3C:4D:5E:6F".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_last_octet_offset_wraps() {
        let addr: BdAddr = "11:22:33:44:55:FF".parse().unwrap();
        assert_eq!(
            addr.with_last_octet_offset(1).to_string(),
            "11:22:33:44:55:00"
        );
        let addr: BdAddr = "11:22:33:44:55:66".parse().unwrap();
        assert_eq!(
            addr.with_last_octet_offset(1).to_string(),
            "11:22:33:44:55:67"
        );
    }
}
