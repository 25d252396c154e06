//! Firmware image metadata model.

pub mod boot_info;
pub mod dfu_file;
pub mod img_info;

pub use boot_info::{BootInfo, has_overlap};
pub use dfu_file::{DfuFile, FileError};
pub use img_info::{IMG_INFO_PATTERN, ImgInfo};
