//! Frame classification and field decoding for the Valence U-BMS CAN protocol.
//!
//! The identifier alone decides what a frame is ([`classify`]); each kind then
//! has a pure decoder working on the payload bytes. All multi-byte fields are
//! big-endian. Layouts are reverse-engineered from field captures, so decoders
//! only look at the bytes they know and ignore anything beyond.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// 1-based module number, as derived from the frame identifier.
pub type ModuleId = u8;

pub const MAX_PAYLOAD_LENGTH: usize = 8;

pub const PACK_STATUS_ID: u32 = 0x0C0;
pub const PACK_CURRENT_ID: u32 = 0x0C1;
pub const PACK_VOLTAGE_ID: u32 = 0x0C2;
pub const PACK_ALARMS_ID: u32 = 0x0C3;
pub const BMS_IDENTITY_ID: u32 = 0x180;

/// Module frames come in pairs starting here: even offset = cell voltages, odd = status.
pub const MODULE_BASE_ID: u32 = 0x350;
/// Highest module count the identifier scheme can address.
pub const MAX_MODULES: u8 = 64;
const MODULE_LAST_ID: u32 = MODULE_BASE_ID + 2 * MAX_MODULES as u32 - 1;

pub const CELLS_PER_FRAME: usize = 4;

const CELL_VOLTAGE_SCALE: f32 = 0.001;
const PACK_VOLTAGE_SCALE: f32 = 0.01;
const CURRENT_SCALE: f32 = 0.1;
const TEMPERATURE_SCALE: f32 = 0.1;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

fn validate_len(kind: MessageKind, buffer: &[u8], required: usize) -> Result<()> {
    if buffer.len() < required {
        log::debug!(
            "Invalid {:?} payload size - required={} received={}",
            kind,
            required,
            buffer.len()
        );
        return Err(Error::MalformedFrame {
            kind,
            expected: required,
            actual: buffer.len(),
        });
    }
    Ok(())
}

fn be_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

fn be_i16(buffer: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

fn quantize_u16(value: f32, scale: f32) -> u16 {
    (value / scale).round().clamp(0.0, u16::MAX as f32) as u16
}

fn quantize_i16(value: f32, scale: f32) -> i16 {
    (value / scale)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// A CAN frame as handed over by the transport, stamped on arrival.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    id: u32,
    data: [u8; MAX_PAYLOAD_LENGTH],
    len: u8,
    timestamp: Instant,
}

impl RawFrame {
    pub fn new(id: u32, payload: &[u8], timestamp: Instant) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(Error::PayloadTooLong(payload.len()));
        }
        let mut data = [0; MAX_PAYLOAD_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            data,
            len: payload.len() as u8,
            timestamp,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#{:02X?}", self.id, self.payload())
    }
}

/// The closed set of frames the U-BMS transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    PackStatus,
    PackCurrent,
    PackVoltage,
    PackAlarms,
    BmsIdentity,
    ModuleCellVoltages,
    ModuleStatus,
    Unrecognized,
}

impl MessageKind {
    /// Minimum payload length the decoder for this kind needs.
    pub const fn min_len(self) -> usize {
        match self {
            MessageKind::PackStatus => 1,
            MessageKind::PackCurrent => 2,
            MessageKind::PackVoltage => 2,
            MessageKind::PackAlarms => 4,
            MessageKind::BmsIdentity => 6,
            MessageKind::ModuleCellVoltages => 2 * CELLS_PER_FRAME,
            MessageKind::ModuleStatus => 4,
            MessageKind::Unrecognized => 0,
        }
    }
}

/// Result of splitting an identifier into command and module index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub kind: MessageKind,
    pub module: Option<ModuleId>,
}

impl Classified {
    const fn pack(kind: MessageKind) -> Self {
        Self { kind, module: None }
    }
}

/// Decomposes a frame identifier. Pure function of `id`.
pub fn classify(id: u32) -> Classified {
    match id {
        PACK_STATUS_ID => Classified::pack(MessageKind::PackStatus),
        PACK_CURRENT_ID => Classified::pack(MessageKind::PackCurrent),
        PACK_VOLTAGE_ID => Classified::pack(MessageKind::PackVoltage),
        PACK_ALARMS_ID => Classified::pack(MessageKind::PackAlarms),
        BMS_IDENTITY_ID => Classified::pack(MessageKind::BmsIdentity),
        MODULE_BASE_ID..=MODULE_LAST_ID => {
            let offset = id - MODULE_BASE_ID;
            let kind = if offset & 1 == 0 {
                MessageKind::ModuleCellVoltages
            } else {
                MessageKind::ModuleStatus
            };
            Classified {
                kind,
                module: Some((offset / 2) as ModuleId + 1),
            }
        }
        _ => Classified::pack(MessageKind::Unrecognized),
    }
}

/// `None` for module numbers the identifier range cannot address.
fn module_frame_id(module: ModuleId, kind: MessageKind) -> Option<u32> {
    if !(1..=MAX_MODULES).contains(&module) {
        return None;
    }
    let base = MODULE_BASE_ID + 2 * u32::from(module - 1);
    Some(match kind {
        MessageKind::ModuleStatus => base + 1,
        _ => base,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    Standby,
    Charge,
    Drive,
    Reserved,
}

impl OperatingMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => OperatingMode::Standby,
            1 => OperatingMode::Charge,
            2 => OperatingMode::Drive,
            _ => OperatingMode::Reserved,
        }
    }

    fn bits(self) -> u8 {
        match self {
            OperatingMode::Standby => 0,
            OperatingMode::Charge => 1,
            OperatingMode::Drive => 2,
            OperatingMode::Reserved => 3,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OperatingMode::Standby => write!(f, "Standby"),
            OperatingMode::Charge => write!(f, "Charge"),
            OperatingMode::Drive => write!(f, "Drive"),
            OperatingMode::Reserved => write!(f, "Reserved"),
        }
    }
}

/// `0x0C0`: SOC as computed by the BMS itself, plus operating mode when sent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackStatus {
    pub soc_percent: u8,
    pub mode: Option<OperatingMode>,
    pub charge_complete: bool,
    pub modules_balancing: Option<u8>,
}

impl PackStatus {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(MessageKind::PackStatus, payload, MessageKind::PackStatus.min_len())?;
        Ok(Self {
            soc_percent: payload[0],
            mode: payload.get(1).map(|mode| OperatingMode::from_bits(*mode)),
            charge_complete: payload.get(1).is_some_and(|mode| read_bit!(*mode, 2)),
            modules_balancing: payload.get(2).copied(),
        })
    }

    /// The balancing count sits behind the mode byte, so a status with a
    /// balancing count but no mode is sent with the mode byte zeroed and
    /// decodes back as [`OperatingMode::Standby`].
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = vec![self.soc_percent];
        if self.mode.is_some() || self.modules_balancing.is_some() {
            let mode = self.mode.map_or(0, OperatingMode::bits);
            payload.push(mode | (u8::from(self.charge_complete) << 2));
        }
        if let Some(balancing) = self.modules_balancing {
            payload.push(balancing);
        }
        payload
    }
}

/// `0x0C1`: pack current, positive while charging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackCurrent {
    pub current: f32,
}

impl PackCurrent {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(MessageKind::PackCurrent, payload, MessageKind::PackCurrent.min_len())?;
        Ok(Self {
            current: be_i16(payload, 0) as f32 * CURRENT_SCALE,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        quantize_i16(self.current, CURRENT_SCALE).to_be_bytes().to_vec()
    }
}

/// `0x0C2`: pack voltage as measured by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackVoltage {
    pub voltage: f32,
}

impl PackVoltage {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(MessageKind::PackVoltage, payload, MessageKind::PackVoltage.min_len())?;
        Ok(Self {
            voltage: be_u16(payload, 0) as f32 * PACK_VOLTAGE_SCALE,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        quantize_u16(self.voltage, PACK_VOLTAGE_SCALE)
            .to_be_bytes()
            .to_vec()
    }
}

/// Voltage and cell temperature alarm bits, shared by the pack alarm frame
/// and the per-module status frame. Bits 6 and 7 are undocumented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoltageTemperatureFlags(pub u8);

impl VoltageTemperatureFlags {
    pub fn cell_under_temperature(self) -> bool {
        read_bit!(self.0, 0)
    }

    pub fn cell_over_temperature(self) -> bool {
        read_bit!(self.0, 1)
    }

    pub fn cell_under_voltage(self) -> bool {
        read_bit!(self.0, 2)
    }

    pub fn cell_over_voltage(self) -> bool {
        read_bit!(self.0, 3)
    }

    pub fn pack_under_voltage(self) -> bool {
        read_bit!(self.0, 4)
    }

    pub fn pack_over_voltage(self) -> bool {
        read_bit!(self.0, 5)
    }
}

/// Current and PCB temperature alarm bits. Over-current is a two bit level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CurrentPcbFlags(pub u8);

impl CurrentPcbFlags {
    pub fn discharge_overcurrent_level(self) -> u8 {
        self.0 & 0x03
    }

    pub fn charge_overcurrent_level(self) -> u8 {
        (self.0 >> 2) & 0x03
    }

    pub fn pcb_over_temperature(self) -> bool {
        read_bit!(self.0, 4)
    }
}

/// `0x0C3`: pack wide alarm summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PackAlarms {
    pub voltage_and_temperature: VoltageTemperatureFlags,
    pub internal_errors: u8,
    pub current_and_pcb: CurrentPcbFlags,
    pub shutdown_reason: u8,
}

impl PackAlarms {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(MessageKind::PackAlarms, payload, MessageKind::PackAlarms.min_len())?;
        Ok(Self {
            voltage_and_temperature: VoltageTemperatureFlags(payload[0]),
            internal_errors: payload[1],
            current_and_pcb: CurrentPcbFlags(payload[2]),
            shutdown_reason: payload[3],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![
            self.voltage_and_temperature.0,
            self.internal_errors,
            self.current_and_pcb.0,
            self.shutdown_reason,
        ]
    }
}

/// `0x180`: part number and firmware of the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BmsIdentity {
    pub part_number: u16,
    pub firmware_version: u16,
    pub bms_type: u8,
    pub hardware_revision: u8,
}

impl BmsIdentity {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(MessageKind::BmsIdentity, payload, MessageKind::BmsIdentity.min_len())?;
        Ok(Self {
            part_number: be_u16(payload, 0),
            firmware_version: be_u16(payload, 2),
            bms_type: payload[4],
            hardware_revision: payload[5],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&self.part_number.to_be_bytes());
        payload.extend_from_slice(&self.firmware_version.to_be_bytes());
        payload.push(self.bms_type);
        payload.push(self.hardware_revision);
        payload
    }
}

/// Even module frame: four cell voltages in millivolts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellVoltages {
    pub cells: [f32; CELLS_PER_FRAME],
}

impl CellVoltages {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let kind = MessageKind::ModuleCellVoltages;
        validate_len(kind, payload, kind.min_len())?;
        let mut cells = [0.0; CELLS_PER_FRAME];
        for (i, cell) in cells.iter_mut().enumerate() {
            *cell = be_u16(payload, 2 * i) as f32 * CELL_VOLTAGE_SCALE;
        }
        Ok(Self { cells })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.cells
            .iter()
            .flat_map(|cell| quantize_u16(*cell, CELL_VOLTAGE_SCALE).to_be_bytes())
            .collect()
    }

    /// Sum of the first `populated` cells; modules with fewer cells pad the frame.
    pub fn module_voltage(&self, populated: usize) -> f32 {
        self.cells.iter().take(populated).sum()
    }
}

/// Odd module frame: temperature and SOC, optionally string current and alarm bits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModuleStatus {
    pub temperature: f32,
    pub soc_percent: f32,
    pub current: Option<f32>,
    pub alarms: VoltageTemperatureFlags,
}

impl ModuleStatus {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(MessageKind::ModuleStatus, payload, MessageKind::ModuleStatus.min_len())?;
        Ok(Self {
            temperature: be_i16(payload, 0) as f32 * TEMPERATURE_SCALE,
            soc_percent: f32::from(be_u16(payload, 2)),
            current: (payload.len() >= 6).then(|| be_i16(payload, 4) as f32 * CURRENT_SCALE),
            alarms: VoltageTemperatureFlags(payload.get(6).copied().unwrap_or_default()),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(7);
        payload.extend_from_slice(&quantize_i16(self.temperature, TEMPERATURE_SCALE).to_be_bytes());
        payload.extend_from_slice(&quantize_u16(self.soc_percent, 1.0).to_be_bytes());
        if let Some(current) = self.current {
            payload.extend_from_slice(&quantize_i16(current, CURRENT_SCALE).to_be_bytes());
            payload.push(self.alarms.0);
        }
        payload
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Message {
    PackStatus(PackStatus),
    PackCurrent(PackCurrent),
    PackVoltage(PackVoltage),
    PackAlarms(PackAlarms),
    BmsIdentity(BmsIdentity),
    ModuleCellVoltages {
        module: ModuleId,
        cells: CellVoltages,
    },
    ModuleStatus {
        module: ModuleId,
        status: ModuleStatus,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PackStatus(_) => MessageKind::PackStatus,
            Message::PackCurrent(_) => MessageKind::PackCurrent,
            Message::PackVoltage(_) => MessageKind::PackVoltage,
            Message::PackAlarms(_) => MessageKind::PackAlarms,
            Message::BmsIdentity(_) => MessageKind::BmsIdentity,
            Message::ModuleCellVoltages { .. } => MessageKind::ModuleCellVoltages,
            Message::ModuleStatus { .. } => MessageKind::ModuleStatus,
        }
    }

    /// Identifier this message is transmitted on, `None` for a module
    /// outside `1..=MAX_MODULES`.
    pub fn identifier(&self) -> Option<u32> {
        match self {
            Message::PackStatus(_) => Some(PACK_STATUS_ID),
            Message::PackCurrent(_) => Some(PACK_CURRENT_ID),
            Message::PackVoltage(_) => Some(PACK_VOLTAGE_ID),
            Message::PackAlarms(_) => Some(PACK_ALARMS_ID),
            Message::BmsIdentity(_) => Some(BMS_IDENTITY_ID),
            Message::ModuleCellVoltages { module, .. } => {
                module_frame_id(*module, MessageKind::ModuleCellVoltages)
            }
            Message::ModuleStatus { module, .. } => {
                module_frame_id(*module, MessageKind::ModuleStatus)
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::PackStatus(status) => status.encode(),
            Message::PackCurrent(current) => current.encode(),
            Message::PackVoltage(voltage) => voltage.encode(),
            Message::PackAlarms(alarms) => alarms.encode(),
            Message::BmsIdentity(identity) => identity.encode(),
            Message::ModuleCellVoltages { cells, .. } => cells.encode(),
            Message::ModuleStatus { status, .. } => status.encode(),
        }
    }
}

/// Classifies and decodes a frame. Unknown identifiers yield
/// [`Error::UnrecognizedFrame`], short payloads [`Error::MalformedFrame`].
pub fn decode(frame: &RawFrame) -> Result<Message> {
    decode_payload(frame.id(), frame.payload())
}

pub fn decode_payload(id: u32, payload: &[u8]) -> Result<Message> {
    let Classified { kind, module } = classify(id);
    let module_id = || module.ok_or(Error::UnrecognizedFrame(id));
    match kind {
        MessageKind::PackStatus => PackStatus::decode(payload).map(Message::PackStatus),
        MessageKind::PackCurrent => PackCurrent::decode(payload).map(Message::PackCurrent),
        MessageKind::PackVoltage => PackVoltage::decode(payload).map(Message::PackVoltage),
        MessageKind::PackAlarms => PackAlarms::decode(payload).map(Message::PackAlarms),
        MessageKind::BmsIdentity => BmsIdentity::decode(payload).map(Message::BmsIdentity),
        MessageKind::ModuleCellVoltages => Ok(Message::ModuleCellVoltages {
            module: module_id()?,
            cells: CellVoltages::decode(payload)?,
        }),
        MessageKind::ModuleStatus => Ok(Message::ModuleStatus {
            module: module_id()?,
            status: ModuleStatus::decode(payload)?,
        }),
        MessageKind::Unrecognized => Err(Error::UnrecognizedFrame(id)),
    }
}
