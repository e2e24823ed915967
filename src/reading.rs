//! One fetch cycle against a `Ready` session.
//!
//! The session is re-checked before and after every suspend point, so a link
//! lost mid-cycle surfaces as [`FetchError::StaleConnection`] rather than
//! partially stale data. A failed transport call also asks the transport
//! whether the link is still up, since the disconnect event may come later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use tokio::time::timeout;

use crate::catalog::GattCharacteristic;
use crate::connection::Session;
use crate::device_info::{DeviceInfo, MeteringReading};
use crate::error::{CharacteristicReadError, FetchError};
use crate::message::{decode_response, encode_get_request, ObisCode, ResponseKind};
use crate::transport::Transport;

pub struct ReadingSession<'a, T: Transport> {
    transport: &'a T,
    session: Session,
    notification_timeout: Duration,
    link_dropped: AtomicBool,
}

impl<'a, T: Transport> ReadingSession<'a, T> {
    pub fn new(transport: &'a T, session: Session, notification_timeout: Duration) -> Self {
        Self { transport, session, notification_timeout, link_dropped: AtomicBool::new(false) }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// True once a transport call failed because the link was already gone,
    /// before the disconnect event reached the session.
    pub fn link_dropped(&self) -> bool {
        self.link_dropped.load(Ordering::SeqCst)
    }

    /// After a failed transport call: `StaleConnection` if the link is gone.
    async fn confirm_link(&self) -> Result<(), FetchError> {
        self.session.check_ready()?;
        if self.transport.is_connected(self.device_id()).await {
            return Ok(());
        }
        warn!("Link to {} is gone", self.device_id());
        self.link_dropped.store(true, Ordering::SeqCst);
        Err(self.session.stale())
    }

    fn device_id(&self) -> &str {
        &self.session.identity().id
    }

    /// Read one characteristic, failing fast if the link goes away meanwhile.
    pub async fn read(&self, characteristic: GattCharacteristic) -> Result<Vec<u8>, FetchError> {
        self.session.check_ready()?;
        let result = self
            .transport
            .read_characteristic(self.device_id(), characteristic.address())
            .await;
        self.session.check_ready()?;

        let value = match result {
            Ok(value) => value,
            Err(source) => {
                self.confirm_link().await?;
                return Err(CharacteristicReadError::Transport {
                    characteristic: characteristic.name(),
                    source,
                }
                .into());
            }
        };
        debug!("{} = {}", characteristic.name(), hex::encode(&value));
        Ok(value)
    }

    /// Read the standard characteristics one after another. A failed read
    /// leaves its field empty and is recorded in `read_errors`.
    pub async fn device_info(&self) -> Result<DeviceInfo, FetchError> {
        let mut builder = DeviceInfo::builder();
        for characteristic in DeviceInfo::FIELDS {
            let applied = match self.read(characteristic).await {
                Ok(value) => builder.apply(characteristic, &value),
                Err(FetchError::Read(err)) => Err(err),
                Err(err) => return Err(err),
            };
            if let Err(err) = applied {
                warn!("{err}");
                builder.record_failure(err);
            }
        }
        Ok(builder.build())
    }

    /// Battery level in percent.
    pub async fn battery_level(&self) -> Result<u8, FetchError> {
        let value = self.read(GattCharacteristic::BatteryLevel).await?;
        match value.as_slice() {
            [level] => Ok(*level),
            _ => Err(CharacteristicReadError::Malformed {
                characteristic: GattCharacteristic::BatteryLevel.name(),
                value: hex::encode(&value),
            }
            .into()),
        }
    }

    /// Issue a Get-Request for `obis` and decode the notification answering it.
    ///
    /// Notifications are armed before the request is written. Anything already
    /// queued at that point cannot belong to this request and is discarded; of
    /// the notifications that follow, the first one is the response.
    pub async fn metering_value(
        &self,
        obis: &[u8],
        kind: ResponseKind,
    ) -> Result<MeteringReading, FetchError> {
        let request = encode_get_request(obis)?;
        let obis = ObisCode::try_from(obis)?;
        let control_point = GattCharacteristic::MeteringControlPoint.address();

        self.session.check_ready()?;
        let subscribed = self
            .transport
            .subscribe_notifications(self.device_id(), control_point)
            .await;
        self.session.check_ready()?;
        let mut notifications = match subscribed {
            Ok(notifications) => notifications,
            Err(err) => {
                self.confirm_link().await?;
                return Err(FetchError::Subscribe(err));
            }
        };

        while let Some(unmatched) = notifications.try_next() {
            warn!("Discarding notification with no pending request: {}", hex::encode(unmatched));
        }

        debug!("TX {obis}: {}", hex::encode(request));
        let written = self
            .transport
            .write_without_response(self.device_id(), control_point, &request)
            .await;
        self.session.check_ready()?;
        if let Err(err) = written {
            self.confirm_link().await?;
            return Err(FetchError::Write(err));
        }

        let response = tokio::select! {
            biased;
            _ = self.session.invalidated() => return Err(self.session.stale()),
            response = timeout(self.notification_timeout, notifications.next()) => response,
        };
        notifications.cancel();

        let frame = match response {
            Ok(Some(frame)) => frame,
            // The transport only closes the registration when the link goes.
            Ok(None) => return Err(self.session.stale()),
            Err(_) => {
                warn!("No response to {obis} within {:?}", self.notification_timeout);
                return Err(FetchError::NoResponse { waited: self.notification_timeout });
            }
        };
        self.session.check_ready()?;

        debug!("RX {obis}: {}", hex::encode(&frame));
        let value = decode_response(&frame, kind)?;
        info!("{obis} = {value}");
        Ok(MeteringReading { obis, frame, value, received_at: SystemTime::now() })
    }
}

#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::config::ClientConfig;
#[cfg(test)]
use crate::connection::ConnectionManager;
#[cfg(test)]
use crate::device_info::DeviceIdentity;
#[cfg(test)]
use crate::error::{CodecError, TransportError};
#[cfg(test)]
use crate::fake_transport::FakeTransport;
#[cfg(test)]
use crate::message::PhysicalValue;

#[cfg(test)]
const VOLTAGE_OBIS: [u8; 6] = [0x00, 0x00, 0x60, 0x06, 0x03, 0xFF];
#[cfg(test)]
const TIMEOUT: Duration = Duration::from_millis(100);

#[cfg(test)]
async fn connected(fake: &Arc<FakeTransport>) -> (ConnectionManager<FakeTransport>, Session) {
    let connections = ConnectionManager::new(Arc::clone(fake), ClientConfig::default());
    let session = connections.connect(DeviceIdentity::new("AA", Some("Meter".into()))).await.unwrap();
    (connections, session)
}

#[tokio::test]
async fn device_info_tolerates_failed_reads() {
    let fake = Arc::new(FakeTransport::new());
    fake.set_value(GattCharacteristic::DeviceName, b"MTR-0042").await;
    fake.set_value(GattCharacteristic::SerialNumber, b"SN123456").await;
    fake.set_value(GattCharacteristic::ManufacturerName, b"Acme").await;
    fake.fail_read(GattCharacteristic::Appearance, TransportError::Platform("read not permitted".into())).await;
    fake.fail_read(GattCharacteristic::FirmwareVersion, TransportError::Platform("gatt error".into())).await;
    fake.fail_read(GattCharacteristic::HardwareRevision, TransportError::Platform("gatt error".into())).await;
    let (_connections, session) = connected(&fake).await;

    let info = ReadingSession::new(fake.as_ref(), session, TIMEOUT).device_info().await.unwrap();

    assert_eq!(info.device_name.as_deref(), Some("MTR-0042"));
    assert_eq!(info.serial_number.as_deref(), Some("SN123456"));
    assert_eq!(info.manufacturer.as_deref(), Some("Acme"));
    assert_eq!(info.appearance, None);
    assert_eq!(info.firmware_version, None);
    assert_eq!(info.hardware_revision, None);
    let failed: Vec<_> = info.read_errors.iter().map(|e| e.characteristic()).collect();
    assert_eq!(failed, ["appearance", "firmware_version", "hardware_revision"]);
    assert_eq!(fake.calls().await.reads.len(), 6);
}

#[tokio::test]
async fn battery_level() {
    let fake = Arc::new(FakeTransport::new());
    fake.set_value(GattCharacteristic::BatteryLevel, &[87]).await;
    let (_connections, session) = connected(&fake).await;

    let level = ReadingSession::new(fake.as_ref(), session, TIMEOUT).battery_level().await.unwrap();

    assert_eq!(level, 87);
}

#[tokio::test]
async fn metering_value_decodes_voltage() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond_with(vec![hex::decode("c40181114a").unwrap()]).await;
    let (_connections, session) = connected(&fake).await;

    let reading = ReadingSession::new(fake.as_ref(), session, TIMEOUT)
        .metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage)
        .await
        .unwrap();

    assert_eq!(reading.value, PhysicalValue::Voltage(4.426));
    assert_eq!(reading.obis, ObisCode::BATTERY_VOLTAGE);
    let calls = fake.calls().await;
    assert_eq!(calls.writes, vec![hex::decode("c0010000600603ff").unwrap()]);
    assert_eq!(calls.armed_at_write, vec![1]);
}

#[tokio::test]
async fn metering_value_takes_first_of_many_notifications() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond_with(vec![
        hex::decode("c401c100000100").unwrap(),
        hex::decode("c401c1ffffffff").unwrap(),
    ])
    .await;
    let (_connections, session) = connected(&fake).await;

    let reading = ReadingSession::new(fake.as_ref(), session, TIMEOUT)
        .metering_value(ObisCode::ACTIVE_ENERGY_IMPORT.as_bytes(), ResponseKind::MeterReading)
        .await
        .unwrap();

    assert_eq!(reading.value, PhysicalValue::MeterReading(256));
}

#[tokio::test]
async fn metering_value_discards_frames_queued_before_request() {
    let fake = Arc::new(FakeTransport::new());
    fake.notify_on_subscribe(vec![hex::decode("c401c10bb8").unwrap()]).await;
    fake.respond_with(vec![hex::decode("c401c10ce4").unwrap()]).await;
    let (_connections, session) = connected(&fake).await;

    let reading = ReadingSession::new(fake.as_ref(), session, TIMEOUT)
        .metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage)
        .await
        .unwrap();

    assert_eq!(reading.value, PhysicalValue::Voltage(3.3));
}

#[tokio::test]
async fn metering_value_without_notification_is_no_response() {
    let fake = Arc::new(FakeTransport::new());
    let (_connections, session) = connected(&fake).await;

    let err = ReadingSession::new(fake.as_ref(), session, TIMEOUT)
        .metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage)
        .await
        .unwrap_err();

    assert_eq!(err, FetchError::NoResponse { waited: TIMEOUT });
}

#[tokio::test]
async fn metering_value_truncated_frame() {
    let fake = Arc::new(FakeTransport::new());
    fake.respond_with(vec![hex::decode("c401c10b").unwrap()]).await;
    let (_connections, session) = connected(&fake).await;

    let err = ReadingSession::new(fake.as_ref(), session, TIMEOUT)
        .metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Codec(CodecError::TruncatedFrame { .. })));
}

#[tokio::test]
async fn metering_value_rejects_bad_obis_before_io() {
    let fake = Arc::new(FakeTransport::new());
    let (_connections, session) = connected(&fake).await;

    let err = ReadingSession::new(fake.as_ref(), session, TIMEOUT)
        .metering_value(&[0x01, 0x00], ResponseKind::Voltage)
        .await
        .unwrap_err();

    assert_eq!(err, FetchError::Codec(CodecError::InvalidObisCode(2)));
    assert!(fake.calls().await.writes.is_empty());
}

#[tokio::test]
async fn link_loss_in_flight_is_stale() {
    let fake = Arc::new(FakeTransport::new());
    fake.drop_link_on_write().await;
    let (_connections, session) = connected(&fake).await;

    let err = ReadingSession::new(fake.as_ref(), session, Duration::from_secs(5))
        .metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage)
        .await
        .unwrap_err();

    assert_eq!(err, FetchError::StaleConnection { device_id: "AA".into() });
}

#[tokio::test]
async fn stale_session_is_rejected_up_front() {
    let fake = Arc::new(FakeTransport::new());
    let (connections, session) = connected(&fake).await;
    connections.disconnect(&session).await.unwrap();

    let err = ReadingSession::new(fake.as_ref(), session, TIMEOUT).device_info().await.unwrap_err();

    assert!(matches!(err, FetchError::StaleConnection { .. }));
    assert!(fake.calls().await.reads.is_empty());
}

#[tokio::test]
async fn link_gone_mid_device_info_is_stale() {
    let fake = Arc::new(FakeTransport::new());
    fake.set_value(GattCharacteristic::DeviceName, b"MTR-0042").await;
    fake.set_value(GattCharacteristic::Appearance, &[0x40, 0x05]).await;
    let (_connections, session) = connected(&fake).await;
    fake.lose_link_after_reads(1).await;

    let reading = ReadingSession::new(fake.as_ref(), session, TIMEOUT);
    let err = reading.device_info().await.unwrap_err();

    assert_eq!(err, FetchError::StaleConnection { device_id: "AA".into() });
    assert!(reading.link_dropped());
    assert_eq!(fake.calls().await.reads.len(), 2);
}

#[tokio::test]
async fn link_gone_before_request_is_stale() {
    let fake = Arc::new(FakeTransport::new());
    let (_connections, session) = connected(&fake).await;
    fake.set_connected("AA", false).await;

    let reading = ReadingSession::new(fake.as_ref(), session, TIMEOUT);
    let err = reading.metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage).await.unwrap_err();

    assert_eq!(err, FetchError::StaleConnection { device_id: "AA".into() });
    assert!(reading.link_dropped());
    assert!(fake.calls().await.writes.is_empty());
}

#[tokio::test]
async fn disconnect_event_ends_wait_before_timeout() {
    let fake = Arc::new(FakeTransport::new());
    fake.keep_notifications_on_drop().await;
    fake.drop_link_on_write().await;
    let (_connections, session) = connected(&fake).await;

    let reading = ReadingSession::new(fake.as_ref(), session, Duration::from_secs(30));
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        reading.metering_value(&VOLTAGE_OBIS, ResponseKind::Voltage),
    )
    .await
    .expect("resolved before the notification timeout")
    .unwrap_err();

    assert_eq!(err, FetchError::StaleConnection { device_id: "AA".into() });
    assert!(!reading.link_dropped());
    assert_eq!(fake.calls().await.writes.len(), 1);
}
