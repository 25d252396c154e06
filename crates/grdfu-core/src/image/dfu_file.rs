//! In-memory firmware/resource file with its trailing image descriptor.
//!
//! Unsigned images end with a 48-byte trailer whose first 40 bytes are the
//! [`ImgInfo`]. Signed images append an 856-byte signature block after it; a
//! marker inside that block tells "signed only" from "signed and encrypted".

use super::img_info::{IMG_INFO_PATTERN, ImgInfo};
use crate::codec::{HexCursor, additive_checksum};
use thiserror::Error;
use tracing::debug;

/// Size of the descriptor trailer of an unsigned image.
pub const TRAILER_SIZE: usize = 48;
/// Signature block appended to signed images.
pub const SIGNATURE_BLOCK_SIZE: usize = 856;
/// Distance of the signing marker from the end of a signed image.
pub const SIGN_MARKER_FROM_END: usize = 256 + 520 + 8;
/// "SIGN": the image is signed but not encrypted.
pub const SIGN_ONLY_MARKER: u32 = 0x4E47_4953;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Input size is zero")]
    Empty,

    #[error("Can't find image information data")]
    TrailerNotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct DfuFile {
    data: Vec<u8>,
    img_info: Option<ImgInfo>,
    checksum: u32,
    encrypted: bool,
    signed: bool,
}

impl DfuFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Firmware image; the descriptor trailer is mandatory.
    pub fn firmware(data: Vec<u8>) -> Result<Self, FileError> {
        let mut file = Self::new();
        file.load(data)?;
        Ok(file)
    }

    /// Resource blob; any non-empty data is accepted.
    pub fn resource(data: Vec<u8>) -> Result<Self, FileError> {
        let mut file = Self::new();
        match file.load(data) {
            Ok(()) | Err(FileError::TrailerNotFound) => Ok(file),
            Err(e) => Err(e),
        }
    }

    /// Replaces the content and probes for the descriptor trailer.
    ///
    /// The data and checksum are kept even when no trailer is found, in which
    /// case [`is_valid_dfu_file`](Self::is_valid_dfu_file) stays false.
    pub fn load(&mut self, data: Vec<u8>) -> Result<(), FileError> {
        *self = Self::default();
        if data.is_empty() {
            return Err(FileError::Empty);
        }
        self.checksum = additive_checksum(&data);
        self.data = data;

        let len = self.data.len();
        let mut cursor = HexCursor::from_slice(&self.data).read_only();

        if let Some(info) = probe(&mut cursor, len.checked_sub(TRAILER_SIZE)) {
            debug!(len, "Found image information of unsigned image");
            self.img_info = Some(info);
            return Ok(());
        }

        if let Some(info) = probe(
            &mut cursor,
            len.checked_sub(TRAILER_SIZE + SIGNATURE_BLOCK_SIZE),
        ) {
            self.img_info = Some(info);
            self.signed = true;
            cursor.set_pos(len - SIGN_MARKER_FROM_END);
            self.encrypted = cursor.get_u32() != SIGN_ONLY_MARKER;
            debug!(len, encrypted = self.encrypted, "Found image information of signed image");
            return Ok(());
        }

        Err(FileError::TrailerNotFound)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn img_info(&self) -> Option<&ImgInfo> {
        self.img_info.as_ref()
    }

    pub fn is_valid_dfu_file(&self) -> bool {
        self.img_info.is_some()
    }

    /// Additive checksum of the whole file.
    pub fn file_checksum(&self) -> u32 {
        self.checksum
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }
}

fn probe(cursor: &mut HexCursor, offset: Option<usize>) -> Option<ImgInfo> {
    let offset = offset?;
    cursor.set_pos(offset);
    if cursor.get_u16() != IMG_INFO_PATTERN {
        return None;
    }
    cursor.set_pos(offset);
    Some(ImgInfo::read_from(cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BootInfo;

    fn trailer() -> Vec<u8> {
        let info = ImgInfo {
            pattern: IMG_INFO_PATTERN,
            version: 2,
            boot_info: BootInfo {
                bin_size: 1000,
                load_addr: 0x0104_0000,
                run_addr: 0x0104_0000,
                ..BootInfo::default()
            },
            comments: "app".into(),
        };
        let mut bytes = info.to_bytes().unwrap();
        bytes.resize(TRAILER_SIZE, 0);
        bytes
    }

    #[test]
    fn test_unsigned_image() {
        let mut data = vec![0x11; 1000];
        data.extend(trailer());
        let file = DfuFile::firmware(data).unwrap();
        assert!(file.is_valid_dfu_file());
        assert!(!file.is_encrypted());
        assert!(!file.is_signed());
        assert_eq!(file.img_info().unwrap().boot_info.load_addr, 0x0104_0000);
        assert_eq!(file.img_info().unwrap().comments, "app");
    }

    fn signed_image(marker: u32) -> Vec<u8> {
        let mut data = vec![0x22; 1000];
        data.extend(trailer());
        data.extend(vec![0u8; SIGNATURE_BLOCK_SIZE]);
        let at = data.len() - SIGN_MARKER_FROM_END;
        data[at..at + 4].copy_from_slice(&marker.to_le_bytes());
        data
    }

    #[test]
    fn test_signed_only_image() {
        let file = DfuFile::firmware(signed_image(SIGN_ONLY_MARKER)).unwrap();
        assert!(file.is_valid_dfu_file());
        assert!(file.is_signed());
        assert!(!file.is_encrypted());
    }

    #[test]
    fn test_signed_and_encrypted_image() {
        let file = DfuFile::firmware(signed_image(0x1234_5678)).unwrap();
        assert!(file.is_signed());
        assert!(file.is_encrypted());
    }

    #[test]
    fn test_missing_trailer() {
        let mut file = DfuFile::new();
        let err = file.load(vec![0u8; 4096]).unwrap_err();
        assert!(matches!(err, FileError::TrailerNotFound));
        assert!(!file.is_valid_dfu_file());
        assert_eq!(file.len(), 4096);
    }

    #[test]
    fn test_short_input_without_trailer() {
        assert!(matches!(
            DfuFile::firmware(vec![0x44, 0x47]),
            Err(FileError::TrailerNotFound)
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(DfuFile::firmware(Vec::new()), Err(FileError::Empty)));
        assert!(matches!(DfuFile::resource(Vec::new()), Err(FileError::Empty)));
    }

    #[test]
    fn test_resource_without_trailer() {
        let file = DfuFile::resource(vec![1, 2, 3]).unwrap();
        assert!(!file.is_valid_dfu_file());
        assert_eq!(file.file_checksum(), 6);
    }

    #[test]
    fn test_file_checksum() {
        let mut data = vec![0xFF; 10];
        data.extend(trailer());
        let expected = additive_checksum(&data);
        let file = DfuFile::firmware(data).unwrap();
        assert_eq!(file.file_checksum(), expected);
    }
}
