//! Command transport of the legacy DFU service.
//!
//! Requests go to the write characteristic as [`encode_frame`] frames,
//! responses arrive as notifications on the notify characteristic. The
//! control characteristic takes raw control-point writes; whether it
//! supports indications tells the protocol version.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::{HexCursor, to_hex};
use crate::error::{DfuError, Result};
use crate::protocol::constants::{
    DFU_CTRL_CHR_UUID, DFU_NOTIFY_CHR_UUID, DFU_SERVICE_UUID, DFU_WRITE_CHR_UUID,
    FRAME_CHECKSUM_SIZE, MAX_RESPONSE_FRAME,
};
use crate::protocol::{FrameHeader, Opcode, encode_frame};
use crate::transport::{BlockingBle, CharProps, CharacteristicInfo, TransportError, WriteType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Single firmware with a built-in DFU service.
    V1 = 1,
    /// AppBootloader solution.
    V2 = 2,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

/// Picks the write type a characteristic supports, preferring no response.
pub(crate) fn write_type_of(chr: &CharacteristicInfo) -> std::result::Result<WriteType, TransportError> {
    if chr.properties.contains(CharProps::WRITE_NO_RESPONSE) {
        Ok(WriteType::WithoutResponse)
    } else if chr.properties.contains(CharProps::WRITE) {
        Ok(WriteType::WithResponse)
    } else {
        Err(TransportError::NotWritable(chr.uuid))
    }
}

pub(crate) fn missing_characteristics(service: Uuid, wanted: &[(&str, Uuid, bool)]) -> DfuError {
    let missing: Vec<String> = wanted
        .iter()
        .filter(|(_, _, found)| !found)
        .map(|(name, uuid, _)| format!("{}<{}>", name, uuid))
        .collect();
    DfuError::protocol(format!(
        "Not found required characteristic of {}: {}",
        service,
        missing.join(", ")
    ))
}

/// Legacy DFU service bound to one link.
pub struct DfuProfile {
    ble: Arc<BlockingBle>,
    notify_chr: CharacteristicInfo,
    write_chr: CharacteristicInfo,
    ctrl_chr: CharacteristicInfo,
    version: ProtocolVersion,
    cmd_timeout: Duration,
}

impl DfuProfile {
    /// Locates the DFU characteristics and subscribes to responses.
    pub fn bind(ble: Arc<BlockingBle>, cmd_timeout: Duration) -> Result<Self> {
        if !ble.is_connected() {
            return Err(TransportError::NotConnected {
                op: "bind DFU service of",
                target: ble.address().to_string(),
            }
            .into());
        }

        let services = ble.services();
        let service = services
            .iter()
            .find(|s| s.uuid == DFU_SERVICE_UUID)
            .ok_or_else(|| {
                DfuError::protocol(format!("Not found required service: {}", DFU_SERVICE_UUID))
            })?;

        let notify = service.characteristic(&DFU_NOTIFY_CHR_UUID);
        let write = service.characteristic(&DFU_WRITE_CHR_UUID);
        let ctrl = service.characteristic(&DFU_CTRL_CHR_UUID);
        let (Some(notify), Some(write), Some(ctrl)) = (notify, write, ctrl) else {
            return Err(missing_characteristics(
                DFU_SERVICE_UUID,
                &[
                    ("TX", DFU_NOTIFY_CHR_UUID, notify.is_some()),
                    ("RX", DFU_WRITE_CHR_UUID, write.is_some()),
                    ("CTRL", DFU_CTRL_CHR_UUID, ctrl.is_some()),
                ],
            ));
        };

        let version = if ctrl.properties.contains(CharProps::INDICATE) {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        };
        debug!(addr = %ble.address(), version = %version, "DFU service bound");

        let profile = Self {
            notify_chr: notify.clone(),
            write_chr: write.clone(),
            ctrl_chr: ctrl.clone(),
            ble,
            version,
            cmd_timeout,
        };
        profile.ble.enable_notification(&profile.notify_chr.uuid, true)?;
        Ok(profile)
    }

    pub fn ble(&self) -> &Arc<BlockingBle> {
        &self.ble
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_app_bootloader_solution(&self) -> bool {
        self.version >= ProtocolVersion::V2
    }

    pub fn cmd_timeout(&self) -> Duration {
        self.cmd_timeout
    }

    /// Writes raw bytes to the control point.
    pub fn write_ctrl_point(&self, data: &[u8]) -> Result<()> {
        let write_type = write_type_of(&self.ctrl_chr)?;
        trace!(data = %to_hex(data), "Control point write");
        self.ble
            .write_chr(&self.ctrl_chr.uuid, data, write_type, self.cmd_timeout)?;
        Ok(())
    }

    /// Writes `data` unframed to the command characteristic.
    pub fn send_cmd_raw(&self, data: &[u8], progress: impl FnMut(usize, usize)) -> Result<()> {
        let write_type = write_type_of(&self.write_chr)?;
        self.ble.write_chr_with_progress(
            &self.write_chr.uuid,
            data,
            write_type,
            self.cmd_timeout,
            progress,
        )?;
        Ok(())
    }

    pub fn send_cmd(&self, opcode: Opcode, params: &[u8]) -> Result<()> {
        let frame = encode_frame(opcode.into(), params)?;
        trace!(opcode = %opcode, len = params.len(), "Send command");
        self.send_cmd_raw(&frame, |_, _| {})
    }

    /// Receives one response frame and returns a read-only cursor over its parameters.
    pub fn rcv_cmd(&self, opcode: Opcode) -> Result<HexCursor> {
        let header_bytes =
            self.ble
                .read_ntf(&self.notify_chr.uuid, FrameHeader::SIZE, self.cmd_timeout)?;
        if header_bytes.len() != FrameHeader::SIZE {
            return Err(DfuError::protocol(format!(
                "Failed to get header of {} response. Got bytes: {}",
                opcode,
                to_hex(&header_bytes)
            )));
        }
        let header = FrameHeader::from_bytes(&header_bytes)?;
        if header.opcode != u16::from(opcode) {
            return Err(DfuError::protocol(format!(
                "Unexpected opcode 0x{:02X} while waiting for {}",
                header.opcode, opcode
            )));
        }
        if header.frame_len() > MAX_RESPONSE_FRAME {
            return Err(DfuError::protocol(format!(
                "Large length of param: {}",
                header.param_len
            )));
        }

        let body_len = usize::from(header.param_len) + FRAME_CHECKSUM_SIZE;
        let body = self
            .ble
            .read_ntf(&self.notify_chr.uuid, body_len, self.cmd_timeout)?;
        if body.len() != body_len {
            return Err(TransportError::Timeout {
                op: "receive response of",
                target: opcode.to_string(),
                timeout_ms: self.cmd_timeout.as_millis() as u64,
            }
            .into());
        }

        let mut frame = HexCursor::from_vec([header_bytes, body].concat()).read_only();
        let params_end = FrameHeader::SIZE + usize::from(header.param_len);
        let expected = frame.checksum(2, params_end - 2) as u16;
        frame.set_pos(params_end);
        let actual = frame.get_u16();
        if expected != actual {
            warn!(
                opcode = %opcode,
                expected = %format!("0x{:04X}", expected),
                actual = %format!("0x{:04X}", actual),
                "Response checksum mismatch"
            );
        }
        frame.set_range(FrameHeader::SIZE, usize::from(header.param_len));
        Ok(frame)
    }
}
