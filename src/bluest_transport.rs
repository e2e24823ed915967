//! [`Transport`] on top of the platform Bluetooth stack, via `bluest`.
//!
//! Devices must have been seen by [`Transport::scan`] before they can be
//! connected, since bluest hands out `Device` handles from advertisements.
//! bluest has no explicit MTU request; [`Transport::request_mtu`] reports
//! `Unsupported` and the platform negotiates on its own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::catalog::CharacteristicAddress;
use crate::error::TransportError;
use crate::transport::{ScanEvent, ScanFilter, Subscription, Transport};

fn platform(err: bluest::Error) -> TransportError {
    TransportError::Platform(err.to_string())
}

fn device_key(device: &Device) -> String {
    format!("{:?}", device.id())
}

/// Keep only the devices for which `keep` resolves to true.
async fn retain_devices<D, F, Fut>(devices: &mut HashMap<String, D>, mut keep: F)
where
    D: Clone,
    F: FnMut(D) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut kept = HashMap::with_capacity(devices.len());
    for (id, device) in devices.drain() {
        if keep(device.clone()).await {
            kept.insert(id, device);
        }
    }
    *devices = kept;
}

pub struct BluestTransport {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    characteristics: Mutex<HashMap<(String, CharacteristicAddress), Characteristic>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    link_poll_interval: Duration,
}

impl BluestTransport {
    /// How often a connected device is polled to notice it going away
    const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Open the default adapter and wait for it to be powered on.
    pub async fn new() -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Mutex::new(HashMap::new()),
            scan_task: Mutex::new(None),
            link_poll_interval: Self::LINK_POLL_INTERVAL,
        }
    }

    pub fn with_link_poll_interval(mut self, interval: Duration) -> Self {
        self.link_poll_interval = interval;
        self
    }

    async fn device(&self, id: &str) -> Result<Device, TransportError> {
        self.devices
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(id.to_string()))
    }

    async fn characteristic(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Characteristic, TransportError> {
        self.characteristics
            .lock()
            .await
            .get(&(id.to_string(), address))
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicNotFound(address.to_string()))
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<Subscription<Result<ScanEvent, TransportError>>, TransportError> {
        // Handles from earlier scans are only worth keeping for live links.
        {
            let mut devices = self.devices.lock().await;
            let before = devices.len();
            retain_devices(&mut *devices, |device: Device| async move {
                device.is_connected().await
            })
            .await;
            debug!("Forgot {} device(s) from earlier scans", before - devices.len());
        }

        let adapter = self.adapter.clone();
        let devices = Arc::clone(&self.devices);
        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut advertisements = match adapter.scan(&filter.services).await {
                Ok(advertisements) => {
                    let _ = started_tx.send(Ok(()));
                    advertisements
                }
                Err(err) => {
                    let _ = started_tx.send(Err(platform(err)));
                    return;
                }
            };

            while let Some(found) = advertisements.next().await {
                let id = device_key(&found.device);
                let name = match found.adv_data.local_name {
                    Some(name) => Some(name),
                    None => found.device.name_async().await.ok(),
                };
                devices.lock().await.insert(id.clone(), found.device);
                if tx.send(Ok(ScanEvent { id, name })).is_err() {
                    break;
                }
            }
            let _ = tx.send(Err(TransportError::Platform("scan stream ended".to_string())));
        });

        started
            .await
            .map_err(|_| TransportError::Platform("scan task ended before starting".to_string()))??;

        let abort = task.abort_handle();
        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(Subscription::new(rx).with_cancel(move || abort.abort()))
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        // Dropping bluest's scan stream stops the scan.
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        let device = self.device(id).await?;
        self.adapter.connect_device(&device).await.map_err(platform)
    }

    async fn request_mtu(&self, _id: &str, _mtu: u16) -> Result<u16, TransportError> {
        Err(TransportError::Unsupported("MTU negotiation"))
    }

    async fn discover_all(&self, id: &str) -> Result<(), TransportError> {
        let device = self.device(id).await?;
        let services = device.discover_services().await.map_err(platform)?;

        let mut found = Vec::new();
        for service in services {
            let service_uuid = service.uuid();
            match service.discover_characteristics().await {
                Ok(characteristics) => {
                    for characteristic in characteristics {
                        let address = CharacteristicAddress::new(service_uuid, characteristic.uuid());
                        found.push((address, characteristic));
                    }
                }
                // Some stacks refuse to enumerate protected services; skip them.
                Err(err) => warn!("Discovering characteristics of {service_uuid} failed: {err}"),
            }
        }
        debug!("Discovered {} characteristics on {id}", found.len());

        let mut cache = self.characteristics.lock().await;
        cache.retain(|(device_id, _), _| device_id != id);
        cache.extend(found.into_iter().map(|(address, c)| ((id.to_string(), address), c)));
        Ok(())
    }

    async fn read_characteristic(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(id, address).await?;
        characteristic.read().await.map_err(platform)
    }

    async fn write_without_response(
        &self,
        id: &str,
        address: CharacteristicAddress,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(id, address).await?;
        characteristic.write_without_response(value).await.map_err(platform)
    }

    async fn subscribe_notifications(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Subscription<Vec<u8>>, TransportError> {
        let characteristic = self.characteristic(id, address).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (armed_tx, armed) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => {
                    let _ = armed_tx.send(Ok(()));
                    notifications
                }
                Err(err) => {
                    let _ = armed_tx.send(Err(platform(err)));
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("Notification error: {err}");
                        break;
                    }
                }
            }
            debug!("Notification stream ended");
        });

        armed
            .await
            .map_err(|_| TransportError::Platform("notification task ended before arming".to_string()))??;

        let abort = task.abort_handle();
        Ok(Subscription::new(rx).with_cancel(move || abort.abort()))
    }

    async fn is_connected(&self, id: &str) -> bool {
        match self.device(id).await {
            Ok(device) => device.is_connected().await,
            Err(_) => false,
        }
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        let device = self.device(id).await?;
        self.characteristics.lock().await.retain(|(device_id, _), _| device_id != id);
        self.adapter.disconnect_device(&device).await.map_err(platform)
    }

    async fn on_disconnected(&self, id: &str) -> Result<Subscription<()>, TransportError> {
        let device = self.device(id).await?;
        let interval = self.link_poll_interval;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !device.is_connected().await {
                    info!("{} is no longer connected", device_key(&device));
                    let _ = tx.send(());
                    return;
                }
            }
        });

        let abort = task.abort_handle();
        Ok(Subscription::new(rx).with_cancel(move || abort.abort()))
    }
}

#[tokio::test]
async fn retain_devices_drops_rejected_entries() {
    let mut devices: HashMap<String, bool> =
        [("AA", true), ("BB", false), ("CC", true)].map(|(id, up)| (id.to_string(), up)).into();

    retain_devices(&mut devices, |up| async move { up }).await;

    let mut left: Vec<_> = devices.keys().map(String::as_str).collect();
    left.sort_unstable();
    assert_eq!(left, ["AA", "CC"]);
}
