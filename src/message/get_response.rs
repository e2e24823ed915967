use std::fmt;
use std::str::FromStr;

use super::PAYLOAD_OFFSET;
use crate::error::CodecError;

/// Which value layout a response frame is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// u16 big endian, millivolts
    Voltage,
    /// u32 big endian, unscaled count in a device defined unit
    MeterReading,
}

impl ResponseKind {
    const TAG_VOLTAGE: u8 = 0x01;
    const TAG_METER_READING: u8 = 0x02;

    /// Width in bytes of the value that follows the header
    pub fn value_width(self) -> usize {
        match self {
            Self::Voltage => 2,
            Self::MeterReading => 4,
        }
    }

    /// Minimum frame length needed to decode this kind.
    pub fn frame_len(self) -> usize {
        PAYLOAD_OFFSET + self.value_width()
    }
}

impl TryFrom<u8> for ResponseKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::TAG_VOLTAGE => Ok(Self::Voltage),
            Self::TAG_METER_READING => Ok(Self::MeterReading),
            other => Err(CodecError::UnknownResponseKind(format!("0x{other:02x}"))),
        }
    }
}

impl FromStr for ResponseKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voltage" => Ok(Self::Voltage),
            "reading" | "meter-reading" | "meter_reading" => Ok(Self::MeterReading),
            _ => Err(CodecError::UnknownResponseKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
    /// The meter decides; typically Wh for energy registers
    DeviceDefined,
}

/// A decoded response value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhysicalValue {
    /// Volts
    Voltage(f64),
    MeterReading(u32),
}

impl PhysicalValue {
    pub fn unit(&self) -> Unit {
        match self {
            Self::Voltage(_) => Unit::Volt,
            Self::MeterReading(_) => Unit::DeviceDefined,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Voltage(volts) => volts,
            Self::MeterReading(count) => f64::from(count),
        }
    }
}

impl fmt::Display for PhysicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voltage(volts) => write!(f, "{volts:.3} V"),
            Self::MeterReading(count) => write!(f, "{count}"),
        }
    }
}

/// Decode the value carried by a response frame.
pub fn decode_response(frame: &[u8], kind: ResponseKind) -> Result<PhysicalValue, CodecError> {
    let payload = frame
        .get(PAYLOAD_OFFSET..kind.frame_len())
        .ok_or(CodecError::TruncatedFrame {
            kind,
            needed: kind.frame_len(),
            actual: frame.len(),
        })?;

    let value = match kind {
        ResponseKind::Voltage => {
            let millivolts = u16::from_be_bytes([payload[0], payload[1]]);
            PhysicalValue::Voltage(f64::from(millivolts) / 1000.0)
        }
        ResponseKind::MeterReading => {
            let count = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            PhysicalValue::MeterReading(count)
        }
    };
    Ok(value)
}

#[test]
fn test_decode_voltage() {
    let frame = hex::decode("c401c10bb8").unwrap();
    let value = decode_response(&frame, ResponseKind::Voltage).unwrap();
    assert_eq!(value, PhysicalValue::Voltage(3.0));
    assert_eq!(value.unit(), Unit::Volt);
}

#[test]
fn test_decode_meter_reading() {
    let frame = hex::decode("c401c100000100").unwrap();
    let value = decode_response(&frame, ResponseKind::MeterReading).unwrap();
    assert_eq!(value, PhysicalValue::MeterReading(256));
    assert_eq!(value.unit(), Unit::DeviceDefined);
}

#[test]
fn test_decode_ignores_trailing_bytes() {
    let frame = hex::decode("c401c1123400ff").unwrap();
    let value = decode_response(&frame, ResponseKind::Voltage).unwrap();
    assert_eq!(value, PhysicalValue::Voltage(4.66));
}

#[test]
fn test_decode_truncated() {
    for len in 0..5 {
        let frame = vec![0x0B; len];
        let result = decode_response(&frame, ResponseKind::Voltage);
        assert_eq!(
            result,
            Err(CodecError::TruncatedFrame { kind: ResponseKind::Voltage, needed: 5, actual: len })
        );
    }
    for len in 0..7 {
        let frame = vec![0x00; len];
        let result = decode_response(&frame, ResponseKind::MeterReading);
        assert!(matches!(result, Err(CodecError::TruncatedFrame { needed: 7, .. })));
    }
}

#[test]
fn test_response_kind_unknown() {
    assert_eq!(ResponseKind::try_from(0x02), Ok(ResponseKind::MeterReading));
    assert!(matches!(ResponseKind::try_from(0x7f), Err(CodecError::UnknownResponseKind(_))));
    assert!(matches!("current".parse::<ResponseKind>(), Err(CodecError::UnknownResponseKind(_))));
}
