//! Flash layout checks run before anything is erased.
//!
//! Each rule names the two regions involved so the error tells exactly what
//! would have been clobbered.

use crate::error::{DfuError, Region, Result};
use crate::image::{BootInfo, DfuFile, FileError, has_overlap};
use crate::protocol::constants::SCA_SIZE;

use super::Payload;

fn ensure_apart(src: Region, dst: Region) -> Result<()> {
    if has_overlap(src.addr, src.size, dst.addr, dst.size) {
        Err(DfuError::Overlap { src, dst })
    } else {
        Ok(())
    }
}

fn image_region(name: &'static str, boot: &BootInfo) -> Region {
    Region::new(name, boot.load_addr, boot.bin_size)
}

/// Where the new firmware finally lives once copied into place.
fn new_app_region(file: &DfuFile, size: u32) -> Result<Region> {
    let img = file.img_info().ok_or(FileError::TrailerNotFound)?;
    Ok(Region::new("APP_NEW", img.boot_info.load_addr, size))
}

fn is_copy_mode(file: &DfuFile, write_addr: u32) -> bool {
    file.img_info()
        .is_some_and(|img| img.boot_info.load_addr != write_addr)
}

/// Layout rules of single-firmware devices.
pub fn check_v1(
    payload: Payload,
    file: &DfuFile,
    write_addr: u32,
    sca: u32,
    running: &BootInfo,
) -> Result<()> {
    let size = file.len() as u32;
    let data = Region::new("DATA", write_addr, size);
    let sca_region = Region::new("SCA", sca, SCA_SIZE);

    ensure_apart(data, sca_region)?;
    if payload.is_firmware() || !payload.to_ext_flash() {
        ensure_apart(data, image_region("APP_OLD", running))?;
    }
    if payload.is_firmware() && is_copy_mode(file, write_addr) {
        let app_new = new_app_region(file, size)?;
        ensure_apart(data, app_new)?;
        ensure_apart(app_new, sca_region)?;
    }
    Ok(())
}

/// Layout rules of AppBootloader devices.
///
/// `running_app` is the application image reported by the chip, if any.
pub fn check_v2(
    payload: Payload,
    file: &DfuFile,
    write_addr: u32,
    sca: u32,
    bootloader: &BootInfo,
    running_app: Option<&BootInfo>,
) -> Result<()> {
    let size = file.len() as u32;
    let data = Region::new("DATA", write_addr, size);
    let sca_region = Region::new("SCA", sca, SCA_SIZE);
    let boot_region = image_region("BOOTLOADER", bootloader);

    ensure_apart(data, sca_region)?;
    ensure_apart(data, boot_region)?;

    match payload {
        Payload::Firmware if is_copy_mode(file, write_addr) => {
            if let Some(app) = running_app {
                ensure_apart(data, image_region("APP_OLD", app))?;
            }
            let app_new = new_app_region(file, size)?;
            ensure_apart(data, app_new)?;
            ensure_apart(app_new, sca_region)?;
            ensure_apart(app_new, boot_region)?;
        }
        Payload::Resource { ext_flash: false } => {
            if let Some(app) = running_app {
                ensure_apart(data, image_region("APP", app))?;
            }
        }
        _ => {}
    }
    Ok(())
}
