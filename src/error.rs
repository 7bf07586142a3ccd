use crate::protocol::{MessageKind, ModuleId};

/// Errors raised by the decoding and aggregation core.
///
/// Everything except [`Error::InvalidTopology`] and [`Error::InvalidConfig`] is a
/// per-frame condition: the frame is dropped and counted, processing continues.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Payload shorter than the decoder for its kind requires.
    #[error("Malformed {kind:?} frame - required={expected} received={actual}")]
    MalformedFrame {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },
    /// Classic CAN carries at most 8 data bytes.
    #[error("Payload of {0} bytes exceeds the 8 byte CAN limit")]
    PayloadTooLong(usize),
    /// Identifier outside the known U-BMS message set.
    #[error("Unrecognized frame identifier 0x{0:03X}")]
    UnrecognizedFrame(u32),
    /// Module ID outside `1..=series*parallel`.
    #[error("Module {0} is outside the configured topology")]
    TopologyViolation(ModuleId),
    /// Fatal startup condition.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
