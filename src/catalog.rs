//! Addresses of every characteristic the core talks to.

use std::fmt;
use std::str::FromStr;

use bluest::Uuid;

use crate::error::CatalogError;

/// Expand a 16 bit Bluetooth SIG assigned number onto the base UUID.
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

pub const GAP_SERVICE: Uuid = sig_uuid(0x1800);
pub const DEVICE_INFORMATION_SERVICE: Uuid = sig_uuid(0x180A);
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180F);
pub const METERING_SERVICE: Uuid = Uuid::from_u128(0x6e5b_0001_7a3c_4d1e_9f2b_5c8d_1a0e_3b47);

pub const DEVICE_NAME: Uuid = sig_uuid(0x2A00);
pub const APPEARANCE: Uuid = sig_uuid(0x2A01);
pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2A19);
pub const SERIAL_NUMBER: Uuid = sig_uuid(0x2A25);
pub const FIRMWARE_REVISION: Uuid = sig_uuid(0x2A26);
pub const HARDWARE_REVISION: Uuid = sig_uuid(0x2A27);
pub const MANUFACTURER_NAME: Uuid = sig_uuid(0x2A29);
/// Write-without-response for requests, notify for responses
pub const METERING_CONTROL_POINT: Uuid = Uuid::from_u128(0x6e5b_0002_7a3c_4d1e_9f2b_5c8d_1a0e_3b47);
/// CCCD written by the transport when notifications are armed
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = sig_uuid(0x2902);

/// A characteristic (or descriptor) located by its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicAddress {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicAddress {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }
}

impl fmt::Display for CharacteristicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattCharacteristic {
    DeviceName,
    Appearance,
    SerialNumber,
    FirmwareVersion,
    HardwareRevision,
    ManufacturerName,
    BatteryLevel,
    MeteringControlPoint,
    MeteringNotifyConfig,
}

impl GattCharacteristic {
    pub const ALL: [GattCharacteristic; 9] = [
        Self::DeviceName,
        Self::Appearance,
        Self::SerialNumber,
        Self::FirmwareVersion,
        Self::HardwareRevision,
        Self::ManufacturerName,
        Self::BatteryLevel,
        Self::MeteringControlPoint,
        Self::MeteringNotifyConfig,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::DeviceName => "device_name",
            Self::Appearance => "appearance",
            Self::SerialNumber => "serial_number",
            Self::FirmwareVersion => "firmware_version",
            Self::HardwareRevision => "hardware_revision",
            Self::ManufacturerName => "manufacturer_name",
            Self::BatteryLevel => "battery_level",
            Self::MeteringControlPoint => "metering_control_point",
            Self::MeteringNotifyConfig => "metering_notify_config",
        }
    }

    pub const fn address(self) -> CharacteristicAddress {
        match self {
            Self::DeviceName => CharacteristicAddress::new(GAP_SERVICE, DEVICE_NAME),
            Self::Appearance => CharacteristicAddress::new(GAP_SERVICE, APPEARANCE),
            Self::SerialNumber => CharacteristicAddress::new(DEVICE_INFORMATION_SERVICE, SERIAL_NUMBER),
            Self::FirmwareVersion => {
                CharacteristicAddress::new(DEVICE_INFORMATION_SERVICE, FIRMWARE_REVISION)
            }
            Self::HardwareRevision => {
                CharacteristicAddress::new(DEVICE_INFORMATION_SERVICE, HARDWARE_REVISION)
            }
            Self::ManufacturerName => {
                CharacteristicAddress::new(DEVICE_INFORMATION_SERVICE, MANUFACTURER_NAME)
            }
            Self::BatteryLevel => CharacteristicAddress::new(BATTERY_SERVICE, BATTERY_LEVEL),
            Self::MeteringControlPoint => {
                CharacteristicAddress::new(METERING_SERVICE, METERING_CONTROL_POINT)
            }
            Self::MeteringNotifyConfig => {
                CharacteristicAddress::new(METERING_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION)
            }
        }
    }
}

impl FromStr for GattCharacteristic {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| CatalogError::UnknownCharacteristic(s.to_string()))
    }
}

/// Look up a characteristic address by its semantic name, e.g. `"serial_number"`.
pub fn lookup(name: &str) -> Result<CharacteristicAddress, CatalogError> {
    name.parse::<GattCharacteristic>().map(GattCharacteristic::address)
}

#[test]
fn test_sig_uuid() {
    assert_eq!(DEVICE_NAME.to_string(), "00002a00-0000-1000-8000-00805f9b34fb");
    assert_eq!(BATTERY_SERVICE.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
}

#[test]
fn test_lookup() {
    let serial = lookup("serial_number").unwrap();
    assert_eq!(serial.service, DEVICE_INFORMATION_SERVICE);
    assert_eq!(serial.characteristic, SERIAL_NUMBER);

    let battery = lookup("battery_level").unwrap();
    assert_eq!(battery, CharacteristicAddress::new(BATTERY_SERVICE, BATTERY_LEVEL));

    let manufacturer = lookup("manufacturer_name").unwrap();
    assert_eq!(manufacturer.service, DEVICE_INFORMATION_SERVICE);
}

#[test]
fn test_lookup_unknown() {
    assert_eq!(
        lookup("tariff_table"),
        Err(CatalogError::UnknownCharacteristic("tariff_table".to_string()))
    );
}

#[test]
fn test_names_are_unique() {
    for c in GattCharacteristic::ALL {
        assert_eq!(c.name().parse::<GattCharacteristic>(), Ok(c));
    }
}
