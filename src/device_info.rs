use std::time::SystemTime;

use crate::catalog::GattCharacteristic;
use crate::error::{CharacteristicReadError, FetchError};
use crate::message::{ObisCode, PhysicalValue};

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Transport assigned id, unique within a scan window
    pub id: String,
    pub name: Option<String>,
    pub discovered_at: SystemTime,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self { id: id.into(), name, discovered_at: SystemTime::now() }
    }
}

/// The standard characteristics reported by a device. Fields are `None` when the
/// read failed or the device left them empty; `read_errors` says which and why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    /// GAP appearance category
    pub appearance: Option<u16>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub hardware_revision: Option<String>,
    pub manufacturer: Option<String>,
    pub read_errors: Vec<CharacteristicReadError>,
}

impl DeviceInfo {
    /// The characteristics making up a `DeviceInfo`, in the order they are read.
    pub const FIELDS: [GattCharacteristic; 6] = [
        GattCharacteristic::DeviceName,
        GattCharacteristic::Appearance,
        GattCharacteristic::SerialNumber,
        GattCharacteristic::FirmwareVersion,
        GattCharacteristic::HardwareRevision,
        GattCharacteristic::ManufacturerName,
    ];

    pub fn builder() -> DeviceInfoBuilder {
        DeviceInfoBuilder::default()
    }

    pub fn is_complete(&self) -> bool {
        self.read_errors.is_empty()
            && self.device_name.is_some()
            && self.appearance.is_some()
            && self.serial_number.is_some()
            && self.firmware_version.is_some()
            && self.hardware_revision.is_some()
            && self.manufacturer.is_some()
    }
}

/// Accumulates characteristic values as they are read.
#[derive(Debug, Default)]
pub struct DeviceInfoBuilder {
    info: DeviceInfo,
}

impl DeviceInfoBuilder {
    /// Decode `value` as read from `characteristic` and store it.
    pub fn apply(
        &mut self,
        characteristic: GattCharacteristic,
        value: &[u8],
    ) -> Result<(), CharacteristicReadError> {
        let slot = match characteristic {
            GattCharacteristic::Appearance => {
                let bytes: [u8; 2] = value.try_into().map_err(|_| CharacteristicReadError::Malformed {
                    characteristic: characteristic.name(),
                    value: hex::encode(value),
                })?;
                self.info.appearance = Some(u16::from_le_bytes(bytes));
                return Ok(());
            }
            GattCharacteristic::DeviceName => &mut self.info.device_name,
            GattCharacteristic::SerialNumber => &mut self.info.serial_number,
            GattCharacteristic::FirmwareVersion => &mut self.info.firmware_version,
            GattCharacteristic::HardwareRevision => &mut self.info.hardware_revision,
            GattCharacteristic::ManufacturerName => &mut self.info.manufacturer,
            other => {
                return Err(CharacteristicReadError::Malformed {
                    characteristic: other.name(),
                    value: hex::encode(value),
                })
            }
        };
        *slot = decode_string(value);
        Ok(())
    }

    pub fn record_failure(&mut self, err: CharacteristicReadError) {
        self.info.read_errors.push(err);
    }

    pub fn build(self) -> DeviceInfo {
        self.info
    }
}

/// GATT strings are UTF-8, sometimes NUL padded.
fn decode_string(value: &[u8]) -> Option<String> {
    let s = String::from_utf8_lossy(value);
    let s = s.trim_end_matches('\0').trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// A decoded answer to one Get-Request
#[derive(Debug, Clone, PartialEq)]
pub struct MeteringReading {
    pub obis: ObisCode,
    /// The notification exactly as received
    pub frame: Vec<u8>,
    pub value: PhysicalValue,
    pub received_at: SystemTime,
}

/// Result of one full fetch cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    pub identity: DeviceIdentity,
    pub info: DeviceInfo,
    pub reading: Result<MeteringReading, FetchError>,
}

#[test]
fn test_builder_decodes_fields() {
    let mut builder = DeviceInfo::builder();
    builder.apply(GattCharacteristic::DeviceName, b"MTR-0042\0\0").unwrap();
    builder.apply(GattCharacteristic::Appearance, &[0x40, 0x05]).unwrap();
    builder.apply(GattCharacteristic::SerialNumber, b"SN123456").unwrap();
    builder.apply(GattCharacteristic::FirmwareVersion, b"1.4.2").unwrap();
    builder.apply(GattCharacteristic::HardwareRevision, b"B").unwrap();
    builder.apply(GattCharacteristic::ManufacturerName, b"Acme Metering").unwrap();
    let info = builder.build();

    assert_eq!(info.device_name.as_deref(), Some("MTR-0042"));
    assert_eq!(info.appearance, Some(0x0540));
    assert_eq!(info.manufacturer.as_deref(), Some("Acme Metering"));
    assert!(info.is_complete());
}

#[test]
fn test_builder_rejects_short_appearance() {
    let mut builder = DeviceInfo::builder();
    let err = builder.apply(GattCharacteristic::Appearance, &[0x40]).unwrap_err();
    assert_eq!(
        err,
        CharacteristicReadError::Malformed { characteristic: "appearance", value: "40".to_string() }
    );
}

#[test]
fn test_builder_empty_string_is_absent() {
    let mut builder = DeviceInfo::builder();
    builder.apply(GattCharacteristic::SerialNumber, b"\0\0\0").unwrap();
    let info = builder.build();
    assert_eq!(info.serial_number, None);
    assert!(!info.is_complete());
}
