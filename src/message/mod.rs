//! The minimal DLMS/COSEM subset spoken over the vendor metering characteristic.
//!
//! A request is a fixed two byte Get-Request header followed by the six byte
//! OBIS code of the requested data point. There is no length field and no checksum.
//!
//! Byte | Meaning
//! -----|---------------------------------------------
//! 0-1  | Get-Request header `[0xC0, 0x01]`
//! 2-7  | OBIS code `A B C D E F`
//!
//! The response arrives as a notification. Its first three bytes are a header
//! that is skipped; the value follows as a big endian unsigned integer whose
//! width depends on the requested [`ResponseKind`].

use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

mod get_request;
mod get_response;

pub use get_request::encode_get_request;
pub use get_response::{decode_response, PhysicalValue, ResponseKind, Unit};

/// Length in bytes of an OBIS code.
pub const OBIS_LEN: usize = 6;
/// Length in bytes of the Get-Request header.
pub const HEADER_LEN: usize = 2;
/// Length in bytes of an encoded Get-Request.
pub const GET_REQUEST_LEN: usize = HEADER_LEN + OBIS_LEN;
/// Offset of the value inside a response frame.
pub const PAYLOAD_OFFSET: usize = 3;

/// A six byte OBIS identifier, displayed as `A-B:C.D.E*F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisCode([u8; OBIS_LEN]);

impl ObisCode {
    /// 0-0:96.6.3*255, battery voltage
    pub const BATTERY_VOLTAGE: ObisCode = ObisCode([0x00, 0x00, 0x60, 0x06, 0x03, 0xFF]);
    /// 1-0:1.8.0*255, active energy import total
    pub const ACTIVE_ENERGY_IMPORT: ObisCode = ObisCode([0x01, 0x00, 0x01, 0x08, 0x00, 0xFF]);

    pub const fn new(bytes: [u8; OBIS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; OBIS_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for ObisCode {
    type Error = CodecError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; OBIS_LEN] = value
            .try_into()
            .map_err(|_| CodecError::InvalidObisCode(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}-{b}:{c}.{d}.{e}*{g}")
    }
}

impl FromStr for ObisCode {
    type Err = CodecError;

    /// Parses `A-B:C.D.E*F`. The `*F` group may be omitted and defaults to 255.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CodecError::MalformedObisCode(s.to_string());

        let (a, rest) = s.split_once('-').ok_or_else(malformed)?;
        let (b, rest) = rest.split_once(':').ok_or_else(malformed)?;
        let (cde, f) = match rest.split_once('*') {
            Some((cde, f)) => (cde, f),
            None => (rest, "255"),
        };

        let mut groups = vec![a, b];
        groups.extend(cde.split('.'));
        groups.push(f);
        if groups.len() != OBIS_LEN {
            return Err(malformed());
        }

        let mut bytes = [0u8; OBIS_LEN];
        for (byte, group) in bytes.iter_mut().zip(groups) {
            *byte = group.trim().parse().map_err(|_| malformed())?;
        }
        Ok(Self(bytes))
    }
}

#[test]
fn test_obis_display() {
    assert_eq!(ObisCode::BATTERY_VOLTAGE.to_string(), "0-0:96.6.3*255");
    assert_eq!(ObisCode::ACTIVE_ENERGY_IMPORT.to_string(), "1-0:1.8.0*255");
}

#[test]
fn test_obis_parse() {
    assert_eq!("1-0:1.8.0*255".parse::<ObisCode>(), Ok(ObisCode::ACTIVE_ENERGY_IMPORT));
    assert_eq!("0-0:96.6.3".parse::<ObisCode>(), Ok(ObisCode::BATTERY_VOLTAGE));
}

#[test]
fn test_obis_parse_malformed() {
    assert!(matches!("1-0:1.8".parse::<ObisCode>(), Err(CodecError::MalformedObisCode(_))));
    assert!(matches!("1-0:1.8.300".parse::<ObisCode>(), Err(CodecError::MalformedObisCode(_))));
    assert!(matches!("garbage".parse::<ObisCode>(), Err(CodecError::MalformedObisCode(_))));
}

#[test]
fn test_obis_from_slice_wrong_length() {
    let result = ObisCode::try_from(&[0x01, 0x00, 0x01][..]);
    assert_eq!(result, Err(CodecError::InvalidObisCode(3)));
}
