//! Legacy DFU engine for single-firmware (v1) and AppBootloader (v2) devices.
//!
//! A firmware update reads the chip and boot information, checks the flash
//! layout, optionally switches the chip into its DFU mode, and then runs the
//! `PROGRAM_START` / `PROGRAM_FLASH` / `PROGRAM_END` sequence. In fast mode
//! the device erases up front and the whole image is streamed unframed.

use std::sync::Arc;
use std::time::Duration;

use num_enum::TryFromPrimitive;
use tracing::{debug, info, instrument, warn};

use crate::codec::{HexCursor, to_hex};
use crate::error::{DfuError, Result};
use crate::events::{DfuListener, TransferProgress};
use crate::image::{BootInfo, DfuFile, FileError, ImgInfo};
use crate::protocol::constants::{
    CTRL_JUMP_PATTERN, DEFAULT_SCA_ADDR, GR551X_SCA_ADDR, GR551X_STACK_SVNS, IMG_LIST_OFFSET,
    IMG_LIST_SLOTS, PROGRAM_SEGMENT_SIZE, RESP_SUCCESS, SYSTEM_CONFIG_READ, SYSTEM_CONFIG_WRITE,
};
use crate::protocol::{EraseState, Opcode};
use crate::transport::{BlePlatform, BlockingBle};

use super::profile::{DfuProfile, ProtocolVersion};
use super::{EngineTiming, Payload, overlap};

const IMG_LIST_BYTES: usize = IMG_LIST_SLOTS * ImgInfo::SIZE;

const PROGRAM_START_FW_PARAMS: usize = 1 + ImgInfo::SIZE;
const PROGRAM_START_RES_PARAMS: usize = 1 + 4 + 4;

const RESET_NONE: u8 = 0x00;
const RESET_RUN_FIRMWARE: u8 = 0x01;
const RESET_RESOURCE: u8 = 0x02;
const RESET_RESOURCE_EXT: u8 = 0x12;

const DFU_MODE_DUAL_BANK: u8 = 0x01;
const DFU_MODE_SINGLE_BANK: u8 = 0x02;

/// Chip identification returned by `GET_INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipInfo {
    pub stack_svn: u32,
    /// Remaining bytes of the response.
    pub raw: Vec<u8>,
}

impl ChipInfo {
    fn read_from(cursor: &mut HexCursor) -> Self {
        let stack_svn = cursor.get_u32();
        let raw = cursor.get_bytes(cursor.remaining());
        Self { stack_svn, raw }
    }

    /// Base address of the system configuration area.
    pub fn sca_address(chip: Option<&ChipInfo>) -> u32 {
        match chip {
            Some(info) if !GR551X_STACK_SVNS.contains(&info.stack_svn) => DEFAULT_SCA_ADDR,
            _ => GR551X_SCA_ADDR,
        }
    }
}

/// Boot information stored at the start of the SCA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupBootInfo {
    /// The chip only accepts encrypted images.
    pub encrypted: bool,
    pub boot_info: BootInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImgInfoList {
    pub encrypted: bool,
    pub images: Vec<ImgInfo>,
}

/// Which firmware answers the DFU service of an AppBootloader device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FirmwarePosition {
    Bootloader = 0,
    App = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBootloaderExtraInfo {
    /// Where the bootloader wants dual-bank images stored.
    pub recommended_save_addr: u32,
    pub position: FirmwarePosition,
    /// Application image currently installed.
    pub app_fw: ImgInfo,
}

fn expect_success(op: &str, resp: u8) -> Result<()> {
    if resp == RESP_SUCCESS {
        Ok(())
    } else {
        Err(DfuError::protocol(format!("{}: Response = {}", op, resp)))
    }
}

fn check_encryption(file: &DfuFile, chip_encrypted: bool) -> Result<()> {
    if file.is_encrypted() != chip_encrypted {
        return Err(DfuError::EncryptionMismatch {
            firmware: file.is_encrypted(),
            chip: chip_encrypted,
        });
    }
    Ok(())
}

fn firmware_info(file: &DfuFile) -> Result<&ImgInfo> {
    file.img_info()
        .ok_or(DfuError::InvalidFile(FileError::TrailerNotFound))
}

pub struct LegacyDfu {
    profile: DfuProfile,
    platform: Option<Arc<dyn BlePlatform>>,
    timing: EngineTiming,
}

impl LegacyDfu {
    pub fn bind(ble: Arc<BlockingBle>, timing: EngineTiming) -> Result<Self> {
        let profile = DfuProfile::bind(ble, timing.legacy_cmd_timeout)?;
        Ok(Self {
            profile,
            platform: None,
            timing,
        })
    }

    /// Platform used to find the AppBootloader after a jump.
    pub fn with_platform(mut self, platform: Arc<dyn BlePlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Switches to another link, e.g. after the device rebooted.
    pub fn rebind(&mut self, ble: Arc<BlockingBle>) -> Result<()> {
        self.profile = DfuProfile::bind(ble, self.timing.legacy_cmd_timeout)?;
        Ok(())
    }

    pub fn profile(&self) -> &DfuProfile {
        &self.profile
    }

    /// Link the engine currently talks over.
    pub fn ble(&self) -> &Arc<BlockingBle> {
        self.profile.ble()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.profile.version()
    }

    fn sleep(&self, duration: Duration) -> Result<()> {
        self.profile.ble().cancel_token().sleep(duration)?;
        Ok(())
    }

    fn require_app_bootloader(&self, op: &str) -> Result<()> {
        if self.profile.is_app_bootloader_solution() {
            Ok(())
        } else {
            Err(DfuError::protocol(format!(
                "{} is only supported by AppBootloader devices",
                op
            )))
        }
    }

    pub fn get_chip_info(&self) -> Result<ChipInfo> {
        self.profile.send_cmd(Opcode::GetInfo, &[])?;
        let mut resp = self.profile.rcv_cmd(Opcode::GetInfo)?;
        expect_success("getChipInfo()", resp.get_u8())?;
        let info = ChipInfo::read_from(&mut resp);
        debug!(stack_svn = %format!("0x{:04X}", info.stack_svn), "Chip info");
        Ok(info)
    }

    /// Sends a `SYSTEM_CONFIG` read and validates the echoed address and length.
    fn read_system_config(&self, addr: u32, len: u16) -> Result<(u8, HexCursor)> {
        let mut params = HexCursor::new(1 + 4 + 2);
        params
            .put_u8(SYSTEM_CONFIG_READ)?
            .put_u32(addr)?
            .put_u16(len)?;
        self.profile.send_cmd(Opcode::SystemConfig, params.as_bytes())?;

        let mut resp = self.profile.rcv_cmd(Opcode::SystemConfig)?;
        expect_success("readSystemConfig()", resp.get_u8())?;
        let op = resp.get_u8();
        let got_addr = resp.get_u32();
        let got_len = resp.get_u16();
        if got_addr != addr || got_len != len {
            return Err(DfuError::protocol(format!(
                "Unexpected system config from 0x{:08X} ({} bytes), requested 0x{:08X} ({} bytes): {}",
                got_addr,
                got_len,
                addr,
                len,
                to_hex(resp.range_bytes())
            )));
        }
        Ok((op, resp))
    }

    pub fn get_startup_boot_info(&self, sca: u32) -> Result<StartupBootInfo> {
        let (op, mut resp) = self.read_system_config(sca, BootInfo::SIZE as u16)?;
        let info = StartupBootInfo {
            encrypted: op & 0xF0 != 0,
            boot_info: BootInfo::read_from(&mut resp),
        };
        debug!(
            load_addr = %format!("0x{:08X}", info.boot_info.load_addr),
            bin_size = info.boot_info.bin_size,
            encrypted = info.encrypted,
            "Startup boot info"
        );
        Ok(info)
    }

    pub fn get_img_list(&self, sca: u32) -> Result<ImgInfoList> {
        let (op, mut resp) =
            self.read_system_config(sca + IMG_LIST_OFFSET, IMG_LIST_BYTES as u16)?;
        let images: Vec<ImgInfo> = (0..IMG_LIST_SLOTS)
            .map(|_| ImgInfo::read_from(&mut resp))
            .filter(ImgInfo::is_valid)
            .collect();
        debug!(count = images.len(), "Image list");
        Ok(ImgInfoList {
            encrypted: op & 0xF0 != 0,
            images,
        })
    }

    pub fn get_app_bootloader_extra_info(&self) -> Result<AppBootloaderExtraInfo> {
        self.require_app_bootloader("getAppBootloaderExtraInfo()")?;
        self.profile.send_cmd(Opcode::GetFwInfo, &[])?;
        let mut resp = self.profile.rcv_cmd(Opcode::GetFwInfo)?;
        expect_success("getAppBootloaderExtraInfo()", resp.get_u8())?;
        let recommended_save_addr = resp.get_u32();
        let raw_position = resp.get_u8();
        let position = FirmwarePosition::try_from(raw_position).map_err(|_| {
            DfuError::protocol(format!("Unknown firmware position: {}", raw_position))
        })?;
        let app_fw = ImgInfo::read_from(&mut resp);
        debug!(
            recommended = %format!("0x{:08X}", recommended_save_addr),
            position = ?position,
            "AppBootloader extra info"
        );
        Ok(AppBootloaderExtraInfo {
            recommended_save_addr,
            position,
            app_fw,
        })
    }

    /// Rewrites the SCA image list so it describes the running image and has
    /// no entry inside `[target_addr, target_addr + target_size)`.
    ///
    /// Returns whether the list was written back.
    pub fn tidy_img_list(
        &self,
        target_addr: u32,
        target_size: u32,
        running: &BootInfo,
        list: &[ImgInfo],
        sca: u32,
    ) -> Result<bool> {
        let mut images = list.to_vec();
        let mut changed = false;

        let running_listed = images.iter().any(|img| {
            img.boot_info.checksum == running.checksum
                && img.boot_info.load_addr == running.load_addr
        });
        if !running_listed {
            images.insert(0, ImgInfo::from_boot(*running));
            changed = true;
        }

        let before = images.len();
        images.retain(|img| !img.boot_info.overlaps(target_addr, target_size));
        changed |= images.len() != before;

        if !changed {
            return Ok(false);
        }
        if images.len() > IMG_LIST_SLOTS {
            warn!(count = images.len(), "Image list too long, dropping the tail");
            images.truncate(IMG_LIST_SLOTS);
        }

        let mut params = HexCursor::new(1 + 4 + 2 + IMG_LIST_BYTES);
        params
            .put_u8(SYSTEM_CONFIG_WRITE)?
            .put_u32(sca + IMG_LIST_OFFSET)?
            .put_u16(IMG_LIST_BYTES as u16)?;
        for img in &images {
            img.write_to(&mut params)?;
        }
        params.fill(IMG_LIST_BYTES, 0xFF)?;

        info!(count = images.len(), "Writing tidied image list");
        self.profile.send_cmd(Opcode::SystemConfig, params.as_bytes())?;
        let mut resp = self.profile.rcv_cmd(Opcode::SystemConfig)?;
        expect_success("tidyImgInfoList()", resp.get_u8())?;
        Ok(true)
    }

    /// Asks the running application to schedule DFU.
    pub fn enable_dfu_schedule(&self) -> Result<()> {
        self.profile.write_ctrl_point(&CTRL_JUMP_PATTERN)
    }

    /// Selects dual-bank or single-bank update. The chip sends no response.
    pub fn set_dfu_mode_of_chip(&self, dual_bank: bool) -> Result<()> {
        self.require_app_bootloader("setDfuModeOfChip()")?;
        let mode = if dual_bank {
            DFU_MODE_DUAL_BANK
        } else {
            DFU_MODE_SINGLE_BANK
        };
        debug!(dual_bank, "Set DFU mode");
        self.profile.send_cmd(Opcode::SetDfuMode, &[mode])
    }

    /// Announces the transfer. In fast mode this also waits for the device to
    /// erase the target area, reporting `(erased, total)` sectors.
    pub fn program_start(
        &self,
        payload: Payload,
        fast: bool,
        file: &DfuFile,
        write_addr: u32,
        mut on_erase: impl FnMut(u16, u16),
    ) -> Result<()> {
        let fast = fast && self.profile.is_app_bootloader_solution();

        let mut kind: u8 = match (payload.to_ext_flash(), fast) {
            (true, true) => 0x03,
            (true, false) => 0x01,
            (false, true) => 0x02,
            (false, false) => 0x00,
        };
        if !payload.to_ext_flash() && self.profile.is_app_bootloader_solution() && file.is_signed()
        {
            kind |= if file.is_encrypted() { 0x20 } else { 0x10 };
        }

        let params = if payload.is_firmware() {
            let mut img = firmware_info(file)?.clone();
            img.boot_info.load_addr = write_addr;
            let mut params = HexCursor::new(PROGRAM_START_FW_PARAMS);
            params.put_u8(kind)?;
            img.write_to(&mut params)?;
            params
        } else {
            let mut params = HexCursor::new(PROGRAM_START_RES_PARAMS);
            params
                .put_u8(kind)?
                .put_u32(write_addr)?
                .put_u32(file.len() as u32)?;
            params
        };

        debug!(kind = %format!("0x{:02X}", kind), addr = %format!("0x{:08X}", write_addr), "Program start");
        self.profile.send_cmd(Opcode::ProgramStart, params.as_bytes())?;
        let mut resp = self.profile.rcv_cmd(Opcode::ProgramStart)?;
        expect_success("programStart()", resp.get_u8())?;
        if !fast {
            return Ok(());
        }

        let _state = resp.get_u8();
        let total = resp.get_u16();
        debug!(sectors = total, "Erase started");
        while total > 0 {
            let mut resp = self.profile.rcv_cmd(Opcode::ProgramStart)?;
            let _resp = resp.get_u8();
            let raw_state = resp.get_u8();
            let erased = resp.get_u16();
            match EraseState::try_from(raw_state) {
                Ok(EraseState::Erasing) => on_erase(erased, total),
                Ok(EraseState::Completed) => break,
                Ok(
                    state @ (EraseState::NotAligned
                    | EraseState::OverlapRunningFirmware
                    | EraseState::Failed
                    | EraseState::NoFlashArea),
                ) => return Err(DfuError::protocol(state.to_string())),
                _ => {
                    return Err(DfuError::protocol(format!(
                        "Error state of erasing: {}",
                        raw_state
                    )));
                }
            }
        }
        Ok(())
    }

    /// Transfers the file. `progress` receives `(written, total)` bytes.
    pub fn program_flash(
        &self,
        payload: Payload,
        fast: bool,
        file: &DfuFile,
        write_addr: u32,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<()> {
        let fast = fast && self.profile.is_app_bootloader_solution();
        let data = file.data();

        if fast {
            self.profile.send_cmd_raw(data, &mut progress)?;
            let mut resp = self.profile.rcv_cmd(Opcode::ProgramFlashFast)?;
            return expect_success("programFlash()", resp.get_u8());
        }

        let kind: u8 = if payload.to_ext_flash() { 0x11 } else { 0x01 };
        let mut written = 0;
        for segment in data.chunks(PROGRAM_SEGMENT_SIZE) {
            let mut params = HexCursor::new(1 + 4 + 2 + segment.len());
            params
                .put_u8(kind)?
                .put_u32(write_addr.wrapping_add(written as u32))?
                .put_u16(segment.len() as u16)?
                .put_bytes(segment)?;
            self.profile.send_cmd(Opcode::ProgramFlash, params.as_bytes())?;
            let mut resp = self.profile.rcv_cmd(Opcode::ProgramFlash)?;
            expect_success("programFlash()", resp.get_u8())?;
            written += segment.len();
            progress(written, data.len());
        }
        Ok(())
    }

    /// Finishes the transfer and tells the chip what to do next.
    ///
    /// A device that resets right away may never answer; that is accepted.
    pub fn program_end(
        &self,
        payload: Payload,
        fast: bool,
        file: &DfuFile,
        run_firmware: bool,
    ) -> Result<()> {
        let fast = fast && self.profile.is_app_bootloader_solution();
        let reset = match payload {
            Payload::Firmware if run_firmware => RESET_RUN_FIRMWARE,
            Payload::Firmware => RESET_NONE,
            Payload::Resource { ext_flash: true } => RESET_RESOURCE_EXT,
            Payload::Resource { ext_flash: false } => RESET_RESOURCE,
        };
        let checksum = file.file_checksum();
        let mut params = HexCursor::new(1 + 4);
        params.put_u8(reset)?.put_u32(checksum)?;

        let exchange = self
            .profile
            .send_cmd(Opcode::ProgramEnd, params.as_bytes())
            .and_then(|()| self.profile.rcv_cmd(Opcode::ProgramEnd));
        let mut resp = match exchange {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                info!("No response of programEnd(), device is restarting");
                return Ok(());
            }
            Err(e) if e.is_connection_lost() && reset == RESET_RUN_FIRMWARE => {
                info!("Connection dropped after programEnd(), device is restarting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        expect_success("programEnd()", resp.get_u8())?;
        if fast {
            let device_checksum = resp.get_u32();
            if device_checksum != checksum {
                return Err(DfuError::protocol(format!(
                    "Checksum mismatch: file = 0x{:08X}, device = 0x{:08X}",
                    checksum, device_checksum
                )));
            }
        }
        Ok(())
    }

    /// Updates the firmware image.
    ///
    /// `write_addr` differing from the image's load address selects copy
    /// (dual-bank) mode. AppBootloader devices pick their recommended address
    /// when it is `None`. `ctrl_cmd` is written to the control point of v1
    /// devices before anything else.
    #[instrument(skip(self, file, ctrl_cmd, listener), fields(addr = %self.ble().address()))]
    pub fn update_firmware(
        &mut self,
        fast: bool,
        file: &DfuFile,
        write_addr: Option<u32>,
        ctrl_cmd: Option<&[u8]>,
        listener: &dyn DfuListener,
    ) -> Result<()> {
        firmware_info(file)?;
        let (fast, write_addr) = if self.profile.is_app_bootloader_solution() {
            (fast, self.prepare_firmware_v2(file, write_addr, listener)?)
        } else {
            (false, self.prepare_firmware_v1(file, write_addr, ctrl_cmd, listener)?)
        };
        self.download(Payload::Firmware, fast, file, write_addr, listener)
    }

    /// Writes a resource blob to internal or external flash.
    #[instrument(skip(self, file, ctrl_cmd, listener), fields(addr = %self.ble().address()))]
    pub fn update_resource(
        &mut self,
        ext_flash: bool,
        fast: bool,
        file: &DfuFile,
        write_addr: u32,
        ctrl_cmd: Option<&[u8]>,
        listener: &dyn DfuListener,
    ) -> Result<()> {
        if file.is_empty() {
            return Err(FileError::Empty.into());
        }
        let payload = Payload::Resource { ext_flash };

        let fast = if self.profile.is_app_bootloader_solution() {
            self.enable_dfu_schedule()?;
            listener.on_dfu_progress(0, 0, "Load chip info...");
            let chip = self.get_chip_info()?;
            let sca = ChipInfo::sca_address(Some(&chip));
            listener.on_dfu_progress(0, 0, "Load boot info...");
            let bootloader = self.get_startup_boot_info(sca)?;
            listener.on_dfu_progress(0, 0, "Load extra info...");
            let extra = self.get_app_bootloader_extra_info()?;
            listener.on_dfu_progress(0, 0, "Check overlap...");
            overlap::check_v2(
                payload,
                file,
                write_addr,
                sca,
                &bootloader.boot_info,
                Some(&extra.app_fw.boot_info),
            )?;
            fast
        } else {
            if let Some(cmd) = ctrl_cmd {
                self.profile.write_ctrl_point(cmd)?;
            }
            listener.on_dfu_progress(0, 0, "Load chip info...");
            let chip = self.get_chip_info()?;
            let sca = ChipInfo::sca_address(Some(&chip));
            listener.on_dfu_progress(0, 0, "Load boot info...");
            let running = self.get_startup_boot_info(sca)?;
            listener.on_dfu_progress(0, 0, "Check overlap...");
            overlap::check_v1(payload, file, write_addr, sca, &running.boot_info)?;
            listener.on_dfu_progress(0, 0, "Load ImgInfo list...");
            let list = self.get_img_list(sca)?;
            self.tidy_img_list(
                write_addr,
                file.len() as u32,
                &running.boot_info,
                &list.images,
                sca,
            )?;
            false
        };

        self.download(payload, fast, file, write_addr, listener)
    }

    fn prepare_firmware_v2(
        &mut self,
        file: &DfuFile,
        write_addr: Option<u32>,
        listener: &dyn DfuListener,
    ) -> Result<u32> {
        let load_addr = firmware_info(file)?.boot_info.load_addr;

        self.enable_dfu_schedule()?;
        listener.on_dfu_progress(0, 0, "Load chip info...");
        let chip = self.get_chip_info()?;
        let sca = ChipInfo::sca_address(Some(&chip));
        listener.on_dfu_progress(0, 0, "Load boot info...");
        let bootloader = self.get_startup_boot_info(sca)?;
        listener.on_dfu_progress(0, 0, "Load extra info...");
        let extra = self.get_app_bootloader_extra_info()?;

        let write_addr = match write_addr {
            Some(addr) => addr,
            None => {
                let addr = extra.recommended_save_addr;
                let status = format!("Use recommended address from chip: 0x{:08X}", addr);
                info!("{}", status);
                listener.on_dfu_progress(0, 0, &status);
                addr
            }
        };

        listener.on_dfu_progress(0, 0, "Check overlap...");
        check_encryption(file, bootloader.encrypted)?;
        overlap::check_v2(
            Payload::Firmware,
            file,
            write_addr,
            sca,
            &bootloader.boot_info,
            Some(&extra.app_fw.boot_info),
        )?;

        let dual_bank = write_addr != load_addr;
        let in_app = extra.position == FirmwarePosition::App;
        if dual_bank || in_app {
            self.set_dfu_mode_of_chip(dual_bank)?;
            self.sleep(self.timing.dfu_mode_settle)?;
        }
        if !dual_bank && in_app {
            self.jump_to_app_bootloader(listener)?;
        }
        Ok(write_addr)
    }

    fn prepare_firmware_v1(
        &mut self,
        file: &DfuFile,
        write_addr: Option<u32>,
        ctrl_cmd: Option<&[u8]>,
        listener: &dyn DfuListener,
    ) -> Result<u32> {
        let load_addr = firmware_info(file)?.boot_info.load_addr;
        let write_addr = write_addr.unwrap_or(load_addr);

        if let Some(cmd) = ctrl_cmd {
            self.profile.write_ctrl_point(cmd)?;
        }
        listener.on_dfu_progress(0, 0, "Load chip info...");
        let chip = self.get_chip_info()?;
        let sca = ChipInfo::sca_address(Some(&chip));
        listener.on_dfu_progress(0, 0, "Load boot info...");
        let running = self.get_startup_boot_info(sca)?;

        listener.on_dfu_progress(0, 0, "Check overlap...");
        check_encryption(file, running.encrypted)?;
        overlap::check_v1(Payload::Firmware, file, write_addr, sca, &running.boot_info)?;

        listener.on_dfu_progress(0, 0, "Load ImgInfo list...");
        let list = self.get_img_list(sca)?;
        self.tidy_img_list(
            load_addr,
            file.len() as u32,
            &running.boot_info,
            &list.images,
            sca,
        )?;
        Ok(write_addr)
    }

    /// Reconnects to the AppBootloader, which advertises at the next address.
    fn jump_to_app_bootloader(&mut self, listener: &dyn DfuListener) -> Result<()> {
        listener.on_dfu_progress(0, 0, "Jump to AppBootloader...");
        let platform = self.platform.clone().ok_or_else(|| {
            DfuError::InvalidArgument("no BLE platform to reconnect to the AppBootloader".into())
        })?;
        let app = Arc::clone(self.profile.ble());
        let target = app.address().with_last_octet_offset(1);

        self.sleep(self.timing.before_jump_disconnect)?;
        app.disconnect()?;
        self.sleep(self.timing.after_jump_disconnect)?;

        info!(target = %target, "Scanning for AppBootloader");
        if platform
            .scan_for_device(&target, self.timing.scan_timeout)?
            .is_none()
        {
            return Err(DfuError::protocol(format!(
                "Not found the advertisement of AppBootloader: {}",
                target
            )));
        }

        let backend = platform.open(&target)?;
        let ble = Arc::new(BlockingBle::new(
            backend,
            app.config().clone(),
            app.cancel_token().clone(),
        ));
        ble.connect()?;
        ble.discover_services()?;
        ble.set_mtu(self.timing.mtu)?;
        self.rebind(ble)?;

        listener.on_dfu_progress(0, 0, "Time for bootloader to take a deep breath...");
        self.sleep(self.timing.bootloader_warmup)
    }

    fn download(
        &self,
        payload: Payload,
        fast: bool,
        file: &DfuFile,
        write_addr: u32,
        listener: &dyn DfuListener,
    ) -> Result<()> {
        let fast = fast && self.profile.is_app_bootloader_solution();
        listener.on_dfu_progress(0, 0, "Downloading...");

        self.program_start(payload, fast, file, write_addr, |erased, total| {
            if total > 0 {
                let percent = 50 * u32::from(erased.min(total)) / u32::from(total);
                listener.on_dfu_progress(percent as u8, 0, "Erasing...");
            }
        })?;

        let mut progress = TransferProgress::new(listener, if fast { 50 } else { 0 }, "Programming...");
        self.program_flash(payload, fast, file, write_addr, |done, total| {
            progress.update(done, total)
        })?;

        self.program_end(payload, fast, file, true)
    }
}
