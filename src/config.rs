//! Client configuration

use std::time::Duration;

use bluest::Uuid;

use crate::message::ObisCode;

/// Timing and protocol settings for a [`MeterClient`](crate::MeterClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long one scan window lasts
    pub scan_window: Duration,
    /// Service filter passed to the transport when scanning
    pub scan_services: Vec<Uuid>,
    /// MTU requested after connecting
    pub mtu: u16,
    /// How long to wait for the notification answering a Get-Request
    pub notification_timeout: Duration,
    /// Data point read as the battery voltage in a snapshot
    pub voltage_obis: ObisCode,
    /// Data point read as the cumulative meter reading
    pub reading_obis: ObisCode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(20),
            scan_services: Vec::new(),
            mtu: 250,
            notification_timeout: Duration::from_secs(5),
            voltage_obis: ObisCode::BATTERY_VOLTAGE,
            reading_obis: ObisCode::ACTIVE_ENERGY_IMPORT,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    pub fn with_scan_services(mut self, services: Vec<Uuid>) -> Self {
        self.scan_services = services;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    pub fn with_voltage_obis(mut self, obis: ObisCode) -> Self {
        self.voltage_obis = obis;
        self
    }

    pub fn with_reading_obis(mut self, obis: ObisCode) -> Self {
        self.reading_obis = obis;
        self
    }
}
