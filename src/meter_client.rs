//! Everything a UI needs to find a metering device, connect to it and read it.
//!
//! The device exposes the standard GAP, Device Information and Battery services,
//! plus a vendor service with one control-point characteristic. Requests in a
//! minimal DLMS/COSEM framing are written to the control point without response
//! and answered by a notification on the same characteristic.
//!
//! Currently the following data can be accessed:
//!
//! - Device name, appearance, serial number, firmware version, hardware revision, manufacturer
//! - Battery level (%)
//! - Battery voltage (V)
//! - Any OBIS register holding a 32 bit count, e.g. the active energy import total

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{watch, Mutex};

use crate::bluest_transport::BluestTransport;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, Link, Session};
use crate::device_info::{DeviceIdentity, DeviceInfo, MeterSnapshot, MeteringReading};
use crate::error::{ConnectError, DisconnectError, FetchError, ScanError};
use crate::message::{PhysicalValue, ResponseKind};
use crate::reading::ReadingSession;
use crate::scan::{ScanStream, Scanner};
use crate::transport::{ScanFilter, Transport};

pub struct MeterClient<T: Transport = BluestTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    connections: ConnectionManager<T>,
    scanner: Scanner<T>,
    /// Held while scanning starts or a link is being set up
    radio: Mutex<()>,
}

impl MeterClient<BluestTransport> {
    /// Create a client on the default Bluetooth adapter.
    pub async fn new_default(config: ClientConfig) -> anyhow::Result<Self> {
        let transport = BluestTransport::new().await?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> MeterClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let transport = Arc::new(transport);
        Self {
            connections: ConnectionManager::new(Arc::clone(&transport), config.clone()),
            scanner: Scanner::new(Arc::clone(&transport)),
            radio: Mutex::new(()),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<Link> {
        self.connections.watch_state()
    }

    /// Scan for the configured window. Returns `None` if a scan is already running.
    ///
    /// Waits for a connect in progress to finish first.
    pub async fn scan(&self) -> Result<Option<ScanStream>, ScanError> {
        self.scan_for(self.config.scan_window).await
    }

    pub async fn scan_for(&self, window: Duration) -> Result<Option<ScanStream>, ScanError> {
        let filter = ScanFilter { services: self.config.scan_services.clone() };
        let _radio = self.radio.lock().await;
        self.scanner.start_scan(window, filter).await
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await;
    }

    /// Connect to a scanned device. A running scan is stopped first.
    pub async fn connect(&self, identity: DeviceIdentity) -> Result<Session, ConnectError> {
        let _radio = self.radio.lock().await;
        self.scanner.stop_scan().await;
        self.connections.connect(identity).await
    }

    pub async fn disconnect(&self, session: &Session) -> Result<(), DisconnectError> {
        self.connections.disconnect(session).await
    }

    pub async fn fetch_device_info(&self, session: &Session) -> Result<DeviceInfo, FetchError> {
        self.with_reading_session(session, |reading| async move {
            let info = reading.device_info().await;
            (reading, info)
        })
        .await
    }

    pub async fn fetch_battery_level(&self, session: &Session) -> Result<u8, FetchError> {
        self.with_reading_session(session, |reading| async move {
            let level = reading.battery_level().await;
            (reading, level)
        })
        .await
    }

    pub async fn fetch_metering_value(
        &self,
        session: &Session,
        obis: &[u8],
        kind: ResponseKind,
    ) -> Result<PhysicalValue, FetchError> {
        Ok(self.fetch_metering_reading(session, obis, kind).await?.value)
    }

    pub async fn fetch_metering_reading(
        &self,
        session: &Session,
        obis: &[u8],
        kind: ResponseKind,
    ) -> Result<MeteringReading, FetchError> {
        self.with_reading_session(session, move |reading| async move {
            let value = reading.metering_value(obis, kind).await;
            (reading, value)
        })
        .await
    }

    /// Read the device information and the battery voltage.
    ///
    /// Only a lost connection fails the whole cycle; any other problem with the
    /// voltage request is kept in the snapshot.
    pub async fn fetch_snapshot(&self, session: &Session) -> Result<MeterSnapshot, FetchError> {
        let info = self.fetch_device_info(session).await?;
        let reading = match self
            .fetch_metering_reading(session, self.config.voltage_obis.as_bytes(), ResponseKind::Voltage)
            .await
        {
            Err(err @ FetchError::StaleConnection { .. }) => return Err(err),
            other => other,
        };
        Ok(MeterSnapshot { identity: session.identity().clone(), info, reading })
    }

    /// Stop scanning and drop the active connection.
    pub async fn shutdown(&self) -> Result<(), DisconnectError> {
        info!("Shutting down");
        let _radio = self.radio.lock().await;
        self.scanner.stop_scan().await;
        self.connections.disconnect_all().await
    }

    async fn reading_session(&self, session: &Session) -> Result<ReadingSession<'_, T>, FetchError> {
        let session = {
            let _radio = self.radio.lock().await;
            self.connections.ensure_ready(session).await?
        };
        Ok(ReadingSession::new(self.transport.as_ref(), session, self.config.notification_timeout))
    }

    /// Run `op` on a ready session. If the transport finds the link gone
    /// before the disconnect event arrives, reconnect once and run it again.
    async fn with_reading_session<'a, R, F, Fut>(
        &'a self,
        session: &Session,
        op: F,
    ) -> Result<R, FetchError>
    where
        F: Fn(ReadingSession<'a, T>) -> Fut,
        Fut: Future<Output = (ReadingSession<'a, T>, Result<R, FetchError>)>,
    {
        let (reading, result) = op(self.reading_session(session).await?).await;
        if !reading.link_dropped() {
            return result;
        }

        self.connections.link_lost(reading.session()).await;
        warn!("Retrying on a new connection to {}", session.identity().id);
        let (reading, result) = op(self.reading_session(reading.session()).await?).await;
        if reading.link_dropped() {
            self.connections.link_lost(reading.session()).await;
        }
        result
    }
}

#[cfg(test)]
use crate::catalog::GattCharacteristic;
#[cfg(test)]
use crate::error::TransportError;
#[cfg(test)]
use crate::fake_transport::FakeTransport;
#[cfg(test)]
use crate::message::ObisCode;
#[cfg(test)]
use crate::transport::ScanEvent;

#[cfg(test)]
fn client() -> (Arc<FakeTransport>, MeterClient<Arc<FakeTransport>>) {
    let fake = Arc::new(FakeTransport::new());
    let config = ClientConfig::default().with_notification_timeout(Duration::from_millis(100));
    (Arc::clone(&fake), MeterClient::new(fake, config))
}

#[cfg(test)]
async fn scan_one(fake: &FakeTransport, client: &MeterClient<Arc<FakeTransport>>) -> DeviceIdentity {
    fake.script_scan(vec![Ok(ScanEvent { id: "AA".into(), name: Some("Meter 42".into()) })]).await;
    let devices = client
        .scan_for(Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap()
        .collect_devices()
        .await
        .unwrap();
    devices.into_iter().next().unwrap()
}

#[tokio::test]
async fn end_to_end_with_partial_device_info() {
    let (fake, client) = client();
    fake.set_value(GattCharacteristic::DeviceName, b"Meter 42").await;
    fake.set_value(GattCharacteristic::Appearance, &[0x40, 0x05]).await;
    fake.set_value(GattCharacteristic::SerialNumber, b"0042").await;
    fake.fail_read(GattCharacteristic::FirmwareVersion, TransportError::Platform("gatt".into())).await;
    fake.fail_read(GattCharacteristic::HardwareRevision, TransportError::Platform("gatt".into())).await;
    fake.fail_read(GattCharacteristic::ManufacturerName, TransportError::Platform("gatt".into())).await;
    fake.respond_with(vec![hex::decode("c401c10bb8").unwrap()]).await;

    let identity = scan_one(&fake, &client).await;
    let session = client.connect(identity).await.unwrap();
    let snapshot = client.fetch_snapshot(&session).await.unwrap();

    assert_eq!(snapshot.identity.id, "AA");
    assert_eq!(snapshot.info.device_name.as_deref(), Some("Meter 42"));
    assert_eq!(snapshot.info.appearance, Some(0x0540));
    assert_eq!(snapshot.info.serial_number.as_deref(), Some("0042"));
    assert_eq!(snapshot.info.firmware_version, None);
    assert_eq!(snapshot.info.hardware_revision, None);
    assert_eq!(snapshot.info.manufacturer, None);
    assert_eq!(snapshot.info.read_errors.len(), 3);
    assert_eq!(snapshot.reading.unwrap().value, PhysicalValue::Voltage(3.0));

    client.disconnect(&session).await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn snapshot_keeps_missing_response() {
    let (fake, client) = client();
    let identity = scan_one(&fake, &client).await;
    let session = client.connect(identity).await.unwrap();

    let snapshot = client.fetch_snapshot(&session).await.unwrap();

    assert!(matches!(snapshot.reading, Err(FetchError::NoResponse { .. })));
    assert_eq!(snapshot.info.read_errors.len(), 6);
}

#[tokio::test]
async fn in_flight_fetch_after_link_loss_is_stale() {
    let (fake, client) = client();
    fake.drop_link_on_write().await;
    let identity = scan_one(&fake, &client).await;
    let session = client.connect(identity).await.unwrap();

    let err = client
        .fetch_metering_value(&session, ObisCode::ACTIVE_ENERGY_IMPORT.as_bytes(), ResponseKind::MeterReading)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::StaleConnection { .. }));
}

#[tokio::test]
async fn fetch_reconnects_once_after_link_loss() {
    let (fake, client) = client();
    fake.set_value(GattCharacteristic::BatteryLevel, &[64]).await;
    let identity = scan_one(&fake, &client).await;
    let session = client.connect(identity).await.unwrap();

    fake.drop_link("AA").await;
    let level = client.fetch_battery_level(&session).await.unwrap();

    assert_eq!(level, 64);
    assert_eq!(fake.calls().await.connects.len(), 2);
}

#[tokio::test]
async fn connect_stops_running_scan() {
    let (fake, client) = client();
    let _stream = client.scan_for(Duration::from_secs(20)).await.unwrap().unwrap();

    client.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    assert_eq!(fake.calls().await.stop_scans, 1);
    client.shutdown().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn link_gone_mid_cycle_reconnects_once_and_rereads() {
    let (fake, client) = client();
    fake.set_value(GattCharacteristic::DeviceName, b"Meter 42").await;
    fake.set_value(GattCharacteristic::Appearance, &[0x40, 0x05]).await;
    fake.set_value(GattCharacteristic::SerialNumber, b"0042").await;
    fake.set_value(GattCharacteristic::FirmwareVersion, b"1.2.0").await;
    fake.set_value(GattCharacteristic::HardwareRevision, b"B").await;
    fake.set_value(GattCharacteristic::ManufacturerName, b"Acme").await;
    let identity = scan_one(&fake, &client).await;
    let session = client.connect(identity).await.unwrap();
    fake.lose_link_after_reads(1).await;

    let info = client.fetch_device_info(&session).await.unwrap();

    assert!(info.is_complete());
    assert!(info.read_errors.is_empty());
    let calls = fake.calls().await;
    assert_eq!(calls.connects.len(), 2);
    assert_eq!(calls.reads.len(), 2 + 6);
    assert_eq!(client.connection_state(), ConnectionState::Ready);
}

#[tokio::test]
async fn link_gone_mid_cycle_with_failed_reconnect_is_stale() {
    let (fake, client) = client();
    fake.set_value(GattCharacteristic::DeviceName, b"Meter 42").await;
    let identity = scan_one(&fake, &client).await;
    let session = client.connect(identity).await.unwrap();
    fake.lose_link_after_reads(1).await;
    fake.fail_connect(TransportError::Platform("out of range".into())).await;

    let err = client.fetch_device_info(&session).await.unwrap_err();

    assert_eq!(err, FetchError::StaleConnection { device_id: "AA".into() });
    assert_eq!(fake.calls().await.connects.len(), 2);
    assert_eq!(client.connection_state(), ConnectionState::Failed);
}

#[tokio::test]
async fn scan_waits_for_connect_in_progress() {
    let (fake, client) = client();
    let client = Arc::new(client);
    let gate = fake.hold_connect().await;

    let connecting = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.connect(DeviceIdentity::new("AA", None)).await.map(|_| ()) }
    });
    while client.connection_state() != ConnectionState::Connecting {
        tokio::task::yield_now().await;
    }
    let scanning = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.scan_for(Duration::from_millis(20)).await.map(|stream| stream.is_some()) }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(fake.calls().await.scans, 0);

    gate.notify_one();
    connecting.await.unwrap().unwrap();
    assert!(scanning.await.unwrap().unwrap());
    assert_eq!(fake.calls().await.scans, 1);
}
