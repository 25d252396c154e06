//! Simulated GR5xxx devices for engine and session tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::codec::{HexCursor, additive_checksum};
use crate::engine::EngineTiming;
use crate::image::{BootInfo, DfuFile, IMG_INFO_PATTERN, ImgInfo};
use crate::protocol::constants::{
    DFU_CTRL_CHR_UUID, DFU_NOTIFY_CHR_UUID, DFU_WRITE_CHR_UUID, FAST_DFU_CMD_CHR_UUID,
    FAST_DFU_DAT_CHR_UUID, FAST_FLASH_SECTOR_SIZE, IMG_LIST_SLOTS, SYSTEM_CONFIG_WRITE,
};
use crate::protocol::{EraseState, FastOpcode, FrameHeader, Opcode, decode_frame, encode_frame};
use crate::transport::{
    BdAddr, BleConfig, BlockingBle, MockGatt, MockPeripheral, MockReaction, dfu_service,
    fast_dfu_service, lock,
};

pub(crate) const APP_ADDR: BdAddr = BdAddr::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]);

pub(crate) fn ble_config() -> BleConfig {
    BleConfig {
        gatt_timeout: Duration::from_secs(2),
        poll_slice: Duration::from_millis(50),
        connect_retry_delay: Duration::from_millis(10),
        ..BleConfig::default()
    }
}

pub(crate) fn timing() -> EngineTiming {
    EngineTiming {
        legacy_cmd_timeout: Duration::from_secs(2),
        fast_cmd_timeout: Duration::from_secs(2),
        scan_timeout: Duration::from_millis(200),
        dfu_mode_settle: Duration::from_millis(10),
        before_jump_disconnect: Duration::from_millis(5),
        after_jump_disconnect: Duration::from_millis(5),
        bootloader_warmup: Duration::from_millis(10),
        flush_settle: Duration::from_millis(5),
        ..EngineTiming::default()
    }
}

/// Connected link with discovered services and the DFU MTU.
pub(crate) fn connect(gatt: &Arc<MockGatt>) -> Arc<BlockingBle> {
    let ble = Arc::new(BlockingBle::new(
        gatt.clone(),
        ble_config(),
        CancelToken::new(),
    ));
    ble.connect().unwrap();
    ble.discover_services().unwrap();
    ble.set_mtu(247).unwrap();
    ble
}

/// Firmware of `len` bytes whose trailer says it loads at `load_addr`.
pub(crate) fn firmware_bytes(load_addr: u32, len: usize) -> Vec<u8> {
    assert!(len >= 48);
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let info = ImgInfo {
        pattern: IMG_INFO_PATTERN,
        version: 1,
        boot_info: BootInfo {
            bin_size: len as u32,
            checksum: 0x0001_2345,
            load_addr,
            run_addr: load_addr,
            ..BootInfo::default()
        },
        comments: "test".to_string(),
    };
    let trailer = info.to_bytes().unwrap();
    let start = len - 48;
    data[start..start + ImgInfo::SIZE].copy_from_slice(&trailer);
    data[start + ImgInfo::SIZE..].fill(0);
    data
}

pub(crate) fn firmware_file(load_addr: u32, len: usize) -> DfuFile {
    DfuFile::firmware(firmware_bytes(load_addr, len)).unwrap()
}

pub(crate) fn boot_info(load_addr: u32, bin_size: u32, checksum: u32) -> BootInfo {
    BootInfo {
        bin_size,
        checksum,
        load_addr,
        run_addr: load_addr,
        ..BootInfo::default()
    }
}

fn frame(opcode: Opcode, params: &[u8]) -> MockReaction {
    MockReaction::Notify(
        DFU_NOTIFY_CHR_UUID,
        encode_frame(opcode.into(), params).unwrap(),
    )
}

fn fast_ack(data: Vec<u8>) -> MockReaction {
    MockReaction::Notify(FAST_DFU_CMD_CHR_UUID, data)
}

/// State of a simulated legacy DFU device.
#[derive(Debug, Default)]
pub(crate) struct LegacyState {
    pub stack_svn: u32,
    pub encrypted: bool,
    /// Boot information at the SCA base.
    pub boot_info: BootInfo,
    pub images: Vec<ImgInfo>,
    /// `(recommended address, position, app image)` of AppBootloader devices.
    pub extra: Option<(u32, u8, ImgInfo)>,
    pub erase_failure: Option<EraseState>,
    /// Drop the link instead of answering a run-firmware `PROGRAM_END`.
    pub reset_silently: bool,
    /// Ignore every command.
    pub mute: bool,

    pub ctrl_writes: Vec<Vec<u8>>,
    pub commands: Vec<(Opcode, Vec<u8>)>,
    /// `(kind, address, data)` of every `PROGRAM_FLASH`.
    pub flashed: Vec<(u8, u32, Vec<u8>)>,
    pub fast_stream: Vec<u8>,
    pub program_end: Option<(u8, u32)>,
    pub image_list_writes: Vec<Vec<ImgInfo>>,
    pub dfu_mode: Option<u8>,

    pub(crate) rx: Vec<u8>,
    pub(crate) fast_expected: Option<usize>,
}

impl LegacyState {
    fn received_checksum(&self) -> u32 {
        if self.fast_stream.is_empty() {
            self.flashed
                .iter()
                .fold(0u32, |acc, (_, _, d)| acc.wrapping_add(additive_checksum(d)))
        } else {
            additive_checksum(&self.fast_stream)
        }
    }

    fn handle(&mut self, opcode: Opcode, params: &[u8]) -> Vec<MockReaction> {
        self.commands.push((opcode, params.to_vec()));
        let mut p = HexCursor::from_slice(params);
        match opcode {
            Opcode::GetInfo => {
                let mut resp = HexCursor::new(1 + 4 + 12);
                resp.put_u8(1).unwrap().put_u32(self.stack_svn).unwrap();
                vec![frame(opcode, resp.as_bytes())]
            }
            Opcode::SystemConfig => {
                let op = p.get_u8();
                let addr = p.get_u32();
                let len = p.get_u16();
                if op == SYSTEM_CONFIG_WRITE {
                    let images = (0..IMG_LIST_SLOTS)
                        .map(|_| ImgInfo::read_from(&mut p))
                        .filter(ImgInfo::is_valid)
                        .collect::<Vec<_>>();
                    self.images = images.clone();
                    self.image_list_writes.push(images);
                    return vec![frame(opcode, &[1])];
                }
                let mut resp = HexCursor::new(1 + 1 + 4 + 2 + usize::from(len));
                resp.put_u8(1).unwrap();
                resp.put_u8(if self.encrypted { 0x10 } else { 0x00 }).unwrap();
                resp.put_u32(addr).unwrap().put_u16(len).unwrap();
                if usize::from(len) == BootInfo::SIZE {
                    self.boot_info.write_to(&mut resp).unwrap();
                } else {
                    for img in &self.images {
                        img.write_to(&mut resp).unwrap();
                    }
                    resp.fill(usize::from(len), 0xFF).unwrap();
                }
                vec![frame(opcode, resp.as_bytes())]
            }
            Opcode::GetFwInfo => {
                let Some((recommended, position, app)) = self.extra.clone() else {
                    return vec![frame(opcode, &[0])];
                };
                let mut resp = HexCursor::new(1 + 4 + 1 + ImgInfo::SIZE);
                resp.put_u8(1).unwrap().put_u32(recommended).unwrap().put_u8(position).unwrap();
                app.write_to(&mut resp).unwrap();
                vec![frame(opcode, resp.as_bytes())]
            }
            Opcode::SetDfuMode => {
                self.dfu_mode = Some(p.get_u8());
                Vec::new()
            }
            Opcode::ProgramStart => {
                let kind = p.get_u8();
                let size = if params.len() == 1 + ImgInfo::SIZE {
                    ImgInfo::read_from(&mut p).boot_info.bin_size
                } else {
                    p.get_u32();
                    p.get_u32()
                };
                if kind & 0x02 == 0 {
                    return vec![frame(opcode, &[1])];
                }

                self.fast_expected = Some(size as usize);
                let sectors = size.div_ceil(FAST_FLASH_SECTOR_SIZE) as u16;
                let [lo, hi] = sectors.to_le_bytes();
                let mut out = vec![frame(opcode, &[1, EraseState::Started.into(), lo, hi])];
                if let Some(state) = self.erase_failure {
                    out.push(frame(opcode, &[0, state.into(), 0, 0]));
                    return out;
                }
                for erased in 1..=sectors {
                    let [lo, hi] = erased.to_le_bytes();
                    out.push(frame(opcode, &[1, EraseState::Erasing.into(), lo, hi]));
                }
                out.push(frame(opcode, &[1, EraseState::Completed.into(), lo, hi]));
                out
            }
            Opcode::ProgramFlash => {
                let kind = p.get_u8();
                let addr = p.get_u32();
                let len = p.get_u16();
                self.flashed.push((kind, addr, p.get_bytes(usize::from(len))));
                vec![frame(opcode, &[1])]
            }
            Opcode::ProgramEnd => {
                let reset = p.get_u8();
                let checksum = p.get_u32();
                self.program_end = Some((reset, checksum));
                if self.reset_silently && reset == 0x01 {
                    return vec![MockReaction::Disconnect];
                }
                let mut resp = HexCursor::new(5);
                resp.put_u8(1).unwrap().put_u32(self.received_checksum()).unwrap();
                vec![frame(opcode, resp.as_bytes())]
            }
            _ => vec![frame(opcode, &[0])],
        }
    }
}

/// Legacy DFU device answering framed commands.
pub(crate) struct LegacyDevice(Arc<Mutex<LegacyState>>);

impl MockPeripheral for LegacyDevice {
    fn on_write(&mut self, chr: Uuid, data: &[u8]) -> Vec<MockReaction> {
        let mut state = lock(&self.0);
        if state.mute {
            return Vec::new();
        }
        if chr == DFU_CTRL_CHR_UUID {
            state.ctrl_writes.push(data.to_vec());
            return Vec::new();
        }
        if chr != DFU_WRITE_CHR_UUID {
            return Vec::new();
        }

        if let Some(expected) = state.fast_expected {
            state.fast_stream.extend_from_slice(data);
            if state.fast_stream.len() < expected {
                return Vec::new();
            }
            state.fast_expected = None;
            return vec![frame(Opcode::ProgramFlashFast, &[1])];
        }

        state.rx.extend_from_slice(data);
        let mut out = Vec::new();
        while state.rx.len() >= FrameHeader::SIZE {
            let header = FrameHeader::from_bytes(&state.rx).unwrap();
            if state.rx.len() < header.frame_len() {
                break;
            }
            let raw: Vec<u8> = state.rx.drain(..header.frame_len()).collect();
            let (header, params) = decode_frame(&raw).unwrap();
            let opcode = Opcode::try_from(header.opcode).unwrap();
            out.extend(state.handle(opcode, &params));
        }
        out
    }
}

/// Legacy device at `addr`; `app_bootloader` selects the v2 service layout.
pub(crate) fn legacy_device(
    addr: BdAddr,
    app_bootloader: bool,
    state: LegacyState,
) -> (Arc<MockGatt>, Arc<Mutex<LegacyState>>) {
    let state = Arc::new(Mutex::new(state));
    let gatt = MockGatt::new(addr, vec![dfu_service(app_bootloader)])
        .with_peripheral(LegacyDevice(state.clone()));
    (Arc::new(gatt), state)
}

/// State of a simulated FastDfu device.
#[derive(Debug, Default)]
pub(crate) struct FastState {
    pub version: u8,
    pub buffer_size: u32,
    pub erase_failure: Option<EraseState>,
    pub flow_pause: bool,
    pub corrupt_checksum: bool,

    pub commands: Vec<FastOpcode>,
    pub ext_flash: Option<bool>,
    pub erase_range: Option<(u32, u32)>,
    pub data: Vec<u8>,
    /// Size of every buffer acknowledged with `NEXT_BUFFER`.
    pub blocks: Vec<usize>,
    pub flushes: u32,
    pub boot_cmd: Option<(FastOpcode, Vec<u8>)>,

    pub(crate) in_block: usize,
}

impl FastState {
    fn on_cmd(&mut self, data: &[u8]) -> Vec<MockReaction> {
        let mut p = HexCursor::from_slice(data);
        let _magic = p.get_u32();
        let opcode = FastOpcode::try_from(p.get_u8()).unwrap();
        self.commands.push(opcode);
        let op = u8::from(opcode);
        match opcode {
            FastOpcode::GetVersion => vec![fast_ack(vec![op, self.version])],
            FastOpcode::GetBufferSize => {
                let mut ack = vec![op];
                ack.extend_from_slice(&self.buffer_size.to_le_bytes());
                vec![fast_ack(ack)]
            }
            FastOpcode::SelectFlashType => {
                self.ext_flash = Some(p.get_u8() != 0);
                vec![fast_ack(vec![op])]
            }
            FastOpcode::EraseFlash => {
                let addr = p.get_u32();
                let size = p.get_u32();
                self.erase_range = Some((addr, size));
                let sectors = size.div_ceil(FAST_FLASH_SECTOR_SIZE) as u16;
                let [lo, hi] = sectors.to_le_bytes();
                let mut out = vec![fast_ack(vec![op, EraseState::Started.into(), lo, hi])];
                if let Some(state) = self.erase_failure {
                    out.push(fast_ack(vec![op, state.into()]));
                    return out;
                }
                for erased in 1..=sectors {
                    let [lo, hi] = erased.to_le_bytes();
                    out.push(fast_ack(vec![op, EraseState::Erasing.into(), lo, hi]));
                }
                out.push(fast_ack(vec![op, EraseState::Completed.into()]));
                out
            }
            FastOpcode::FlushFlash => {
                self.flushes += 1;
                vec![fast_ack(vec![op])]
            }
            FastOpcode::VerifyChecksum => {
                let mut checksum = additive_checksum(&self.data);
                if self.corrupt_checksum {
                    checksum = checksum.wrapping_add(1);
                }
                let mut ack = vec![op];
                ack.extend_from_slice(&checksum.to_le_bytes());
                vec![fast_ack(ack)]
            }
            FastOpcode::WriteBoot | FastOpcode::StartCopy => {
                self.boot_cmd = Some((opcode, p.remaining_bytes().to_vec()));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_dat(&mut self, data: &[u8]) -> Vec<MockReaction> {
        self.data.extend_from_slice(data);
        if self.version >= 3 {
            return Vec::new();
        }
        self.in_block += data.len();
        let total = self.erase_range.map_or(0, |(_, size)| size as usize);
        if self.in_block as u32 >= self.buffer_size || self.data.len() >= total {
            self.blocks.push(std::mem::take(&mut self.in_block));
            let op = if self.flow_pause {
                FastOpcode::FlowCtrlPause
            } else {
                FastOpcode::NextBuffer
            };
            return vec![fast_ack(vec![op.into()])];
        }
        Vec::new()
    }
}

pub(crate) struct FastDevice(Arc<Mutex<FastState>>);

impl MockPeripheral for FastDevice {
    fn on_write(&mut self, chr: Uuid, data: &[u8]) -> Vec<MockReaction> {
        let mut state = lock(&self.0);
        if chr == FAST_DFU_CMD_CHR_UUID {
            state.on_cmd(data)
        } else if chr == FAST_DFU_DAT_CHR_UUID {
            state.on_dat(data)
        } else {
            Vec::new()
        }
    }
}

pub(crate) fn fast_device(addr: BdAddr, state: FastState) -> (Arc<MockGatt>, Arc<Mutex<FastState>>) {
    let state = Arc::new(Mutex::new(state));
    let gatt =
        MockGatt::new(addr, vec![fast_dfu_service()]).with_peripheral(FastDevice(state.clone()));
    (Arc::new(gatt), state)
}
