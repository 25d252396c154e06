//! FastDfu engine.
//!
//! Commands go to the CMD characteristic and are acknowledged by a single
//! notification on it. Image data is streamed to the DAT characteristic. The
//! device erases the target area itself, reporting progress as it goes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::codec::{HexCursor, to_hex};
use crate::error::{DfuError, Region, Result};
use crate::events::{DfuListener, TransferProgress};
use crate::image::{DfuFile, FileError, ImgInfo};
use crate::protocol::constants::{
    FAST_DEFAULT_BUFFER_SIZE, FAST_DFU_CMD_CHR_UUID, FAST_DFU_DAT_CHR_UUID,
    FAST_DFU_SERVICE_UUID, FAST_FLASH_SECTOR_SIZE,
};
use crate::protocol::{EraseState, FastCmd, FastOpcode};
use crate::transport::{BlockingBle, CharacteristicInfo, TransportError};

use super::EngineTiming;
use super::profile::{missing_characteristics, write_type_of};

/// Versions from this one on take the whole image in one stream.
const STREAMING_VERSION: u8 = 3;

/// What a FastDfu run writes and how it is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastTarget {
    /// Firmware written in place at its load address.
    Firmware,
    /// Firmware staged at `copy_addr`, copied into place by the bootloader.
    FirmwareCopy { copy_addr: u32 },
    Resource { ext_flash: bool, addr: u32 },
}

pub struct FastDfu {
    ble: Arc<BlockingBle>,
    cmd_chr: CharacteristicInfo,
    dat_chr: CharacteristicInfo,
    timing: EngineTiming,
}

impl FastDfu {
    pub fn bind(ble: Arc<BlockingBle>, timing: EngineTiming) -> Result<Self> {
        if !ble.is_connected() {
            return Err(TransportError::NotConnected {
                op: "bind FastDfu service of",
                target: ble.address().to_string(),
            }
            .into());
        }
        let cmd = ble.find_characteristic(&FAST_DFU_SERVICE_UUID, &FAST_DFU_CMD_CHR_UUID);
        let dat = ble.find_characteristic(&FAST_DFU_SERVICE_UUID, &FAST_DFU_DAT_CHR_UUID);
        let (Some(cmd_chr), Some(dat_chr)) = (cmd.clone(), dat.clone()) else {
            if !ble.services().iter().any(|s| s.uuid == FAST_DFU_SERVICE_UUID) {
                return Err(DfuError::protocol(format!(
                    "Not found required service: {}",
                    FAST_DFU_SERVICE_UUID
                )));
            }
            return Err(missing_characteristics(
                FAST_DFU_SERVICE_UUID,
                &[
                    ("CMD", FAST_DFU_CMD_CHR_UUID, cmd.is_some()),
                    ("DAT", FAST_DFU_DAT_CHR_UUID, dat.is_some()),
                ],
            ));
        };

        ble.enable_notification(&cmd_chr.uuid, true)?;
        debug!(addr = %ble.address(), "FastDfu service bound");
        Ok(Self {
            ble,
            cmd_chr,
            dat_chr,
            timing,
        })
    }

    pub fn ble(&self) -> &Arc<BlockingBle> {
        &self.ble
    }

    fn cmd_timeout(&self) -> Duration {
        self.timing.fast_cmd_timeout
    }

    fn send_dat(&self, data: &[u8], progress: impl FnMut(usize, usize)) -> Result<()> {
        let write_type = write_type_of(&self.dat_chr)?;
        self.ble.write_chr_with_progress(
            &self.dat_chr.uuid,
            data,
            write_type,
            self.cmd_timeout(),
            progress,
        )?;
        Ok(())
    }

    /// Sends a command without waiting for its acknowledgement.
    fn post_cmd(&self, cmd: &FastCmd) -> Result<()> {
        let write_type = write_type_of(&self.cmd_chr)?;
        self.ble.write_chr(
            &self.cmd_chr.uuid,
            cmd.as_bytes(),
            write_type,
            self.cmd_timeout(),
        )?;
        Ok(())
    }

    /// Next acknowledgement; its first byte is the opcode it answers.
    fn wait_ack(&self) -> Result<HexCursor> {
        let ack = self
            .ble
            .read_ntf_chunk(&self.cmd_chr.uuid, self.cmd_timeout())?;
        Ok(HexCursor::from_vec(ack).read_only())
    }

    fn send_cmd(&self, cmd: &FastCmd) -> Result<HexCursor> {
        self.post_cmd(cmd)?;
        let mut ack = self.wait_ack()?;
        let opcode = ack.get_u8();
        if opcode != u8::from(cmd.opcode()) {
            return Err(DfuError::protocol(format!(
                "Unexpected ACK opcode = 0x{:02X} for {}",
                opcode,
                cmd.opcode()
            )));
        }
        Ok(ack)
    }

    pub fn get_version(&self) -> Result<u8> {
        let mut ack = self.send_cmd(&FastCmd::new(FastOpcode::GetVersion))?;
        Ok(ack.get_u8())
    }

    pub fn set_flash_type(&self, ext_flash: bool) -> Result<()> {
        let mut cmd = FastCmd::with_params(FastOpcode::SelectFlashType, 1);
        cmd.params().put_u8(u8::from(ext_flash))?;
        self.send_cmd(&cmd)?;
        Ok(())
    }

    /// Size of the device's receive buffer; fixed from the streaming version on.
    pub fn get_buffer_size(&self, version: u8) -> Result<u32> {
        if version >= STREAMING_VERSION {
            return Ok(FAST_DEFAULT_BUFFER_SIZE);
        }
        let mut ack = self.send_cmd(&FastCmd::new(FastOpcode::GetBufferSize))?;
        Ok(ack.get_u32())
    }

    /// Erases `[addr, addr + size)`, forwarding per-sector progress.
    pub fn erase_flash(&self, addr: u32, size: u32, listener: &dyn DfuListener) -> Result<()> {
        let mut cmd = FastCmd::with_params(FastOpcode::EraseFlash, 8);
        cmd.params().put_u32(addr)?.put_u32(size)?;
        self.post_cmd(&cmd)?;

        let sectors = size.div_ceil(FAST_FLASH_SECTOR_SIZE).max(1);
        loop {
            let mut ack = self.wait_ack()?;
            if ack.range_size() < 2 || ack.get_u8() != u8::from(FastOpcode::EraseFlash) {
                return Err(DfuError::protocol(format!(
                    "eraseFlash(): Response = {}",
                    to_hex(ack.range_bytes())
                )));
            }
            let raw_state = ack.get_u8();
            match EraseState::try_from(raw_state) {
                Ok(EraseState::Started) => {
                    debug!(sectors = ack.get_u16(), "Erase started");
                }
                Ok(EraseState::Erasing) => {
                    let erased = u32::from(ack.get_u16());
                    let percent = (100 * erased.min(sectors) / sectors) as u8;
                    listener.on_dfu_progress(percent, 0, "Erasing...");
                }
                Ok(EraseState::Completed) => return Ok(()),
                Ok(EraseState::NoFlashArea) => {
                    return Err(DfuError::protocol("No external flash"));
                }
                Ok(state) => return Err(DfuError::protocol(state.to_string())),
                Err(_) => {
                    return Err(DfuError::protocol(format!(
                        "Unknown code of erasing: {}",
                        raw_state
                    )));
                }
            }
        }
    }

    /// Streams the file into the device's buffer and flushes it to flash.
    pub fn program_flash(
        &self,
        version: u8,
        file: &DfuFile,
        buffer_size: u32,
        listener: &dyn DfuListener,
    ) -> Result<()> {
        let data = file.data();
        let mut progress = TransferProgress::new(listener, 0, "Program flash...");

        if version >= STREAMING_VERSION {
            self.send_dat(data, |done, total| progress.update(done, total))?;
        } else {
            let block_size = usize::try_from(buffer_size.max(1)).unwrap_or(usize::MAX);
            let mut written = 0;
            for block in data.chunks(block_size) {
                self.send_dat(block, |_, _| {})?;
                written += block.len();
                progress.update(written, data.len());

                let mut ack = self.wait_ack()?;
                let raw = ack.get_u8();
                match FastOpcode::try_from(raw) {
                    Ok(FastOpcode::NextBuffer) => {}
                    Ok(FastOpcode::FlowCtrlPause) => {
                        return Err(DfuError::protocol("FlowCtrl = true, buffer overflowed"));
                    }
                    Ok(FastOpcode::FlowCtrlResume) => {
                        return Err(DfuError::protocol("FlowCtrl = false, not expected here"));
                    }
                    _ => {
                        return Err(DfuError::protocol(format!(
                            "Unknown code while programming: 0x{:02X}",
                            raw
                        )));
                    }
                }
            }
        }

        self.send_cmd(&FastCmd::new(FastOpcode::FlushFlash))?;
        Ok(())
    }

    pub fn verify_checksum(&self, file: &DfuFile) -> Result<()> {
        let checksum = file.file_checksum();
        let mut cmd = FastCmd::with_params(FastOpcode::VerifyChecksum, 4);
        cmd.params().put_u32(checksum)?;
        let mut ack = self.send_cmd(&cmd)?;
        let device = ack.get_u32();
        if device != checksum {
            return Err(DfuError::protocol(format!(
                "Checksum mismatch: file = 0x{:08X}, device = 0x{:08X}",
                checksum, device
            )));
        }
        Ok(())
    }

    /// Hands the new image to the bootloader; the device reboots without acknowledging.
    pub fn reboot(&self, file: &DfuFile, copy_addr: Option<u32>) -> Result<()> {
        let img = file.img_info().ok_or(FileError::TrailerNotFound)?;
        let cmd = match copy_addr {
            Some(addr) => {
                let mut cmd = FastCmd::with_params(FastOpcode::StartCopy, ImgInfo::SIZE + 8);
                img.write_to(cmd.params())?;
                cmd.params().put_u32(addr)?.put_u32(file.len() as u32)?;
                cmd
            }
            None => {
                let mut cmd = FastCmd::with_params(FastOpcode::WriteBoot, ImgInfo::SIZE);
                img.write_to(cmd.params())?;
                cmd
            }
        };
        info!(opcode = %cmd.opcode(), "Reboot into new firmware");
        self.post_cmd(&cmd)
    }

    fn sleep(&self, duration: Duration) -> Result<()> {
        self.ble.cancel_token().sleep(duration)?;
        Ok(())
    }

    /// Runs a complete FastDfu update.
    #[instrument(skip(self, file, listener), fields(addr = %self.ble.address()))]
    pub fn update(
        &self,
        target: FastTarget,
        file: &DfuFile,
        listener: &dyn DfuListener,
    ) -> Result<()> {
        if file.is_empty() {
            return Err(FileError::Empty.into());
        }
        let size = file.len() as u32;

        let (write_addr, ext_flash, copy_addr) = match target {
            FastTarget::Firmware => {
                let img = file.img_info().ok_or(FileError::TrailerNotFound)?;
                (img.boot_info.load_addr, false, None)
            }
            FastTarget::FirmwareCopy { copy_addr } => {
                let img = file.img_info().ok_or(FileError::TrailerNotFound)?;
                if img.boot_info.overlaps(copy_addr, size) {
                    return Err(DfuError::Overlap {
                        src: Region::new("COPY", copy_addr, size),
                        dst: Region::new("APP_NEW", img.boot_info.load_addr, size),
                    });
                }
                (copy_addr, false, Some(copy_addr))
            }
            FastTarget::Resource { ext_flash, addr } => (addr, ext_flash, None),
        };

        listener.on_dfu_progress(0, 0, "Get version");
        let version = self.get_version()?;
        listener.on_dfu_progress(0, 0, "Get size of buffer");
        let buffer_size = self.get_buffer_size(version)?;
        info!(version, buffer_size, "FastDfu device");

        if ext_flash {
            listener.on_dfu_progress(0, 0, &format!("Use Ext-flash: {}", ext_flash));
        } else {
            listener.on_dfu_progress(0, 0, "Set flash type as inner-flash");
        }
        self.set_flash_type(ext_flash)?;

        self.erase_flash(write_addr, size, listener)?;
        self.program_flash(version, file, buffer_size, listener)?;
        self.sleep(self.timing.flush_settle)?;
        self.verify_checksum(file)?;

        if !matches!(target, FastTarget::Resource { .. }) {
            self.reboot(file, copy_addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelListener, DfuEvent, NullListener};
    use crate::testkit::{APP_ADDR, FastState, connect, fast_device, firmware_file, timing};
    use crate::transport::lock;

    fn v2_state() -> FastState {
        FastState {
            version: 2,
            buffer_size: 4096,
            ..FastState::default()
        }
    }

    #[test]
    fn test_buffered_firmware_update() {
        let (gatt, state) = fast_device(APP_ADDR, v2_state());
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = firmware_file(0x0101_0000, 10_000);
        let (listener, rx) = ChannelListener::new();

        dfu.update(FastTarget::Firmware, &file, &listener).unwrap();

        let state = lock(&state);
        assert_eq!(state.blocks, vec![4096, 4096, 1808]);
        assert_eq!(state.flushes, 1);
        assert_eq!(state.ext_flash, Some(false));
        assert_eq!(state.erase_range, Some((0x0101_0000, 10_000)));
        assert_eq!(state.data, file.data());
        let (opcode, params) = state.boot_cmd.clone().unwrap();
        assert_eq!(opcode, FastOpcode::WriteBoot);
        assert_eq!(params, file.img_info().unwrap().to_bytes().unwrap());

        let statuses: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e {
                DfuEvent::Progress { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses[0], "Get version");
        assert!(statuses.iter().any(|s| s == "Set flash type as inner-flash"));
        assert!(statuses.iter().any(|s| s == "Erasing..."));
        assert!(statuses.iter().any(|s| s == "Program flash..."));
    }

    #[test]
    fn test_streaming_version_skips_buffer_acks() {
        let (gatt, state) = fast_device(
            APP_ADDR,
            FastState {
                version: 3,
                ..FastState::default()
            },
        );
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = firmware_file(0x0101_0000, 9000);

        dfu.update(FastTarget::Firmware, &file, &NullListener).unwrap();

        let state = lock(&state);
        assert!(!state.commands.contains(&FastOpcode::GetBufferSize));
        assert!(state.blocks.is_empty());
        assert_eq!(state.flushes, 1);
        assert_eq!(state.data.len(), 9000);
    }

    #[test]
    fn test_copy_mode_sends_start_copy() {
        let (gatt, state) = fast_device(APP_ADDR, v2_state());
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = firmware_file(0x0101_0000, 5000);

        dfu.update(
            FastTarget::FirmwareCopy {
                copy_addr: 0x0104_0000,
            },
            &file,
            &NullListener,
        )
        .unwrap();

        let state = lock(&state);
        assert_eq!(state.erase_range, Some((0x0104_0000, 5000)));
        let (opcode, params) = state.boot_cmd.clone().unwrap();
        assert_eq!(opcode, FastOpcode::StartCopy);
        let mut tail = HexCursor::from_slice(&params[ImgInfo::SIZE..]);
        assert_eq!(tail.get_u32(), 0x0104_0000);
        assert_eq!(tail.get_u32(), 5000);
    }

    #[test]
    fn test_copy_address_overlapping_image_rejected() {
        let (gatt, state) = fast_device(APP_ADDR, v2_state());
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = firmware_file(0x0101_0000, 5000);

        let err = dfu
            .update(
                FastTarget::FirmwareCopy {
                    copy_addr: 0x0101_0800,
                },
                &file,
                &NullListener,
            )
            .unwrap_err();
        assert!(matches!(err, DfuError::Overlap { .. }));
        assert!(lock(&state).commands.is_empty());
    }

    #[test]
    fn test_resource_to_ext_flash_does_not_reboot() {
        let (gatt, state) = fast_device(APP_ADDR, v2_state());
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = DfuFile::resource(vec![0x33; 2000]).unwrap();

        dfu.update(
            FastTarget::Resource {
                ext_flash: true,
                addr: 0x0020_0000,
            },
            &file,
            &NullListener,
        )
        .unwrap();

        let state = lock(&state);
        assert_eq!(state.ext_flash, Some(true));
        assert_eq!(state.blocks, vec![2000]);
        assert!(state.boot_cmd.is_none());
    }

    #[test]
    fn test_checksum_mismatch_fails() {
        let mut device = v2_state();
        device.corrupt_checksum = true;
        let (gatt, state) = fast_device(APP_ADDR, device);
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = firmware_file(0x0101_0000, 3000);

        let err = dfu
            .update(FastTarget::Firmware, &file, &NullListener)
            .unwrap_err();
        assert!(err.to_string().starts_with("Checksum mismatch"));
        assert!(lock(&state).boot_cmd.is_none());
    }

    #[test]
    fn test_flow_control_pause_is_fatal() {
        let mut device = v2_state();
        device.flow_pause = true;
        let (gatt, _) = fast_device(APP_ADDR, device);
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = firmware_file(0x0101_0000, 3000);

        let err = dfu
            .update(FastTarget::Firmware, &file, &NullListener)
            .unwrap_err();
        assert_eq!(err.to_string(), "FlowCtrl = true, buffer overflowed");
    }

    #[test]
    fn test_erase_without_ext_flash() {
        let mut device = v2_state();
        device.erase_failure = Some(EraseState::NoFlashArea);
        let (gatt, _) = fast_device(APP_ADDR, device);
        let dfu = FastDfu::bind(connect(&gatt), timing()).unwrap();
        let file = DfuFile::resource(vec![1; 100]).unwrap();

        let err = dfu
            .update(
                FastTarget::Resource {
                    ext_flash: true,
                    addr: 0,
                },
                &file,
                &NullListener,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "No external flash");
    }

    #[test]
    fn test_bind_requires_fast_service() {
        let (gatt, _) = crate::testkit::legacy_device(
            APP_ADDR,
            false,
            crate::testkit::LegacyState::default(),
        );
        let err = FastDfu::bind(connect(&gatt), timing()).err().unwrap();
        assert!(err.to_string().contains("Not found required service"));
    }
}
