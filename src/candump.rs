//! `candump -L` log lines: `(<seconds>.<micros>) <iface> <ID>#<hex payload>`.

use crate::protocol::{RawFrame, MAX_PAYLOAD_LENGTH};
use crate::Result;
use std::fmt::Write;
use std::time::{Duration, Instant};

const STANDARD_ID_DIGITS: usize = 3;
const EXTENDED_ID_DIGITS: usize = 8;
const STANDARD_ID_MAX: u32 = 0x7FF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandumpRecord {
    /// Capture time as written by candump, usually since the Unix epoch.
    pub timestamp: Duration,
    pub interface: String,
    pub id: u32,
    pub payload: Vec<u8>,
}

impl CandumpRecord {
    /// Frame stamped with `arrival`; the capture time only paces replays.
    pub fn to_frame(&self, arrival: Instant) -> Result<RawFrame> {
        RawFrame::new(self.id, &self.payload, arrival)
    }
}

fn parse_timestamp(field: &str) -> Option<Duration> {
    let inner = field.strip_prefix('(')?.strip_suffix(')')?;
    let (seconds, fraction) = inner.split_once('.').unwrap_or((inner, ""));
    let seconds = seconds.parse::<u64>().ok()?;
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos = if fraction.is_empty() {
        0
    } else {
        fraction.parse::<u32>().ok()? * 10u32.pow(9 - fraction.len() as u32)
    };
    Some(Duration::new(seconds, nanos))
}

fn parse_payload(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || hex.len() > 2 * MAX_PAYLOAD_LENGTH {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Parses one line. Blank lines, comments, remote frames, CAN FD frames and
/// anything malformed yield `None`.
pub fn parse_line(line: &str) -> Option<CandumpRecord> {
    let mut fields = line.split_whitespace();
    let timestamp = parse_timestamp(fields.next()?)?;
    let interface = fields.next()?;
    let (id, data) = fields.next()?.split_once('#')?;
    if fields.next().is_some() {
        return None;
    }
    if data.starts_with('#') || data.starts_with('R') {
        log::trace!("Skipping non data frame {id}#{data}");
        return None;
    }
    if id.len() != STANDARD_ID_DIGITS && id.len() != EXTENDED_ID_DIGITS {
        return None;
    }
    let id = u32::from_str_radix(id, 16).ok()?;
    let payload = parse_payload(data)?;
    Some(CandumpRecord {
        timestamp,
        interface: interface.to_string(),
        id,
        payload,
    })
}

/// Formats a frame the way `candump -L` does.
pub fn format_line(timestamp: Duration, interface: &str, id: u32, payload: &[u8]) -> String {
    let mut line = format!(
        "({}.{:06}) {} ",
        timestamp.as_secs(),
        timestamp.subsec_micros(),
        interface
    );
    if id > STANDARD_ID_MAX {
        let _ = write!(line, "{id:08X}#");
    } else {
        let _ = write!(line, "{id:03X}#");
    }
    for byte in payload {
        let _ = write!(line, "{byte:02X}");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_frame() {
        let record = parse_line("(1697040000.123456) can0 351#00FA005000640000").unwrap();
        assert_eq!(
            record,
            CandumpRecord {
                timestamp: Duration::new(1_697_040_000, 123_456_000),
                interface: "can0".into(),
                id: 0x351,
                payload: vec![0x00, 0xFA, 0x00, 0x50, 0x00, 0x64, 0x00, 0x00],
            }
        );
    }

    #[test]
    fn parses_empty_payload_and_extended_id() {
        let record = parse_line("(12.5) vcan1 18FF50E5#").unwrap();
        assert_eq!(record.timestamp, Duration::from_millis(12_500));
        assert_eq!(record.id, 0x18FF_50E5);
        assert!(record.payload.is_empty());
    }

    #[test]
    fn skips_what_is_not_a_classic_data_frame() {
        for line in [
            "",
            "# recorded on the test bench",
            "(1.0) can0 0C0#R",
            "(1.0) can0 0C0##0112233",
            "(1.0) can0 0C0#123",
            "(1.0) can0 0C0#001122334455667788",
            "(1.0) can0 C0#50",
            "can0 0C0#50",
            "(x.0) can0 0C0#50",
            "(1.0) can0 0C0#ZZ",
        ] {
            assert_eq!(parse_line(line), None, "{line:?}");
        }
    }

    #[test]
    fn formats_like_candump() {
        let line = format_line(Duration::new(7, 1_500_000), "can0", 0x0C1, &[0xFF, 0x9C]);
        assert_eq!(line, "(7.001500) can0 0C1#FF9C");
        assert_eq!(
            parse_line(&line).map(|record| record.payload),
            Some(vec![0xFF, 0x9C])
        );
        assert_eq!(
            format_line(Duration::ZERO, "can0", 0x1234_5678, &[]),
            "(0.000000) can0 12345678#"
        );
    }

    #[test]
    fn record_becomes_a_frame() {
        let arrival = Instant::now();
        let frame = parse_line("(1.0) can0 0C0#50")
            .unwrap()
            .to_frame(arrival)
            .unwrap();
        assert_eq!(frame.id(), 0x0C0);
        assert_eq!(frame.payload(), &[0x50]);
        assert_eq!(frame.timestamp(), arrival);
    }
}
