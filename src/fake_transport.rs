//! Scripted in-memory transport for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::catalog::{CharacteristicAddress, GattCharacteristic};
use crate::error::TransportError;
use crate::transport::{ScanEvent, ScanFilter, Subscription, Transport};

#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub connects: Vec<String>,
    pub cancels: Vec<String>,
    pub mtu_requests: Vec<u16>,
    pub reads: Vec<CharacteristicAddress>,
    pub writes: Vec<Vec<u8>>,
    pub scans: usize,
    pub stop_scans: usize,
    /// Number of notification subscriptions armed at the time of each write
    pub armed_at_write: Vec<usize>,
}

#[derive(Default)]
struct State {
    connected: HashSet<String>,
    connect_error: Option<TransportError>,
    mtu_error: Option<TransportError>,
    discovery_error: Option<TransportError>,
    cancel_error: Option<TransportError>,
    scan_error: Option<TransportError>,
    scan_script: Vec<Result<ScanEvent, TransportError>>,
    values: HashMap<CharacteristicAddress, Result<Vec<u8>, TransportError>>,
    /// Frames pushed to subscribers when a request is written
    responses: Vec<Vec<u8>>,
    /// Frames pushed as soon as notifications are armed
    unsolicited: Vec<Vec<u8>>,
    drop_on_write: bool,
    /// Reads that still succeed before the link silently goes away
    reads_until_silent_drop: Option<usize>,
    /// Notification registrations outlive a dropped link
    keep_notifications_on_drop: bool,
    connect_gate: Option<Arc<Notify>>,
    notifications: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    disconnects: HashMap<String, Vec<mpsc::UnboundedSender<()>>>,
    scan_tx: Option<mpsc::UnboundedSender<Result<ScanEvent, TransportError>>>,
    calls: Calls,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Arc<Mutex<State>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Calls {
        self.state.lock().await.calls.clone()
    }

    pub async fn fail_connect(&self, err: TransportError) {
        self.state.lock().await.connect_error = Some(err);
    }

    pub async fn fail_mtu(&self, err: TransportError) {
        self.state.lock().await.mtu_error = Some(err);
    }

    pub async fn fail_discovery(&self, err: TransportError) {
        self.state.lock().await.discovery_error = Some(err);
    }

    pub async fn fail_cancel(&self, err: TransportError) {
        self.state.lock().await.cancel_error = Some(err);
    }

    pub async fn fail_scan(&self, err: TransportError) {
        self.state.lock().await.scan_error = Some(err);
    }

    pub async fn script_scan(&self, events: Vec<Result<ScanEvent, TransportError>>) {
        self.state.lock().await.scan_script = events;
    }

    /// Deliver one more advertisement to a running scan.
    pub async fn advertise(&self, event: Result<ScanEvent, TransportError>) {
        if let Some(tx) = &self.state.lock().await.scan_tx {
            let _ = tx.send(event);
        }
    }

    pub async fn set_value(&self, characteristic: GattCharacteristic, value: &[u8]) {
        self.state.lock().await.values.insert(characteristic.address(), Ok(value.to_vec()));
    }

    pub async fn fail_read(&self, characteristic: GattCharacteristic, err: TransportError) {
        self.state.lock().await.values.insert(characteristic.address(), Err(err));
    }

    pub async fn respond_with(&self, frames: Vec<Vec<u8>>) {
        self.state.lock().await.responses = frames;
    }

    pub async fn notify_on_subscribe(&self, frames: Vec<Vec<u8>>) {
        self.state.lock().await.unsolicited = frames;
    }

    /// Drop the link right after the next request is written.
    pub async fn drop_link_on_write(&self) {
        self.state.lock().await.drop_on_write = true;
    }

    /// After `reads` more successful reads, lose the link without any
    /// disconnect event, the way a platform stack notices it late.
    pub async fn lose_link_after_reads(&self, reads: usize) {
        self.state.lock().await.reads_until_silent_drop = Some(reads);
    }

    /// Keep notification channels open when the link drops.
    pub async fn keep_notifications_on_drop(&self) {
        self.state.lock().await.keep_notifications_on_drop = true;
    }

    /// Hold the next connect attempt until the returned gate is notified.
    pub async fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().await.connect_gate = Some(Arc::clone(&gate));
        gate
    }

    pub async fn set_connected(&self, id: &str, connected: bool) {
        let mut state = self.state.lock().await;
        if connected {
            state.connected.insert(id.to_string());
        } else {
            state.connected.remove(id);
        }
    }

    /// Simulate the device going out of range.
    pub async fn drop_link(&self, id: &str) {
        let mut state = self.state.lock().await;
        Self::drop_link_locked(&mut state, id);
    }

    fn drop_link_locked(state: &mut State, id: &str) {
        state.connected.remove(id);
        if !state.keep_notifications_on_drop {
            state.notifications.clear();
        }
        if let Some(watchers) = state.disconnects.remove(id) {
            for tx in watchers {
                let _ = tx.send(());
            }
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn scan(
        &self,
        _filter: ScanFilter,
    ) -> Result<Subscription<Result<ScanEvent, TransportError>>, TransportError> {
        let mut state = self.state.lock().await;
        state.calls.scans += 1;
        if let Some(err) = state.scan_error.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in state.scan_script.drain(..) {
            let _ = tx.send(event);
        }
        state.scan_tx = Some(tx);
        Ok(Subscription::new(rx))
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.calls.stop_scans += 1;
        state.scan_tx = None;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        let gate = {
            let mut state = self.state.lock().await;
            state.calls.connects.push(id.to_string());
            if let Some(err) = state.connect_error.clone() {
                return Err(err);
            }
            state.connect_gate.take()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state.lock().await.connected.insert(id.to_string());
        Ok(())
    }

    async fn request_mtu(&self, _id: &str, mtu: u16) -> Result<u16, TransportError> {
        let mut state = self.state.lock().await;
        state.calls.mtu_requests.push(mtu);
        match state.mtu_error.clone() {
            Some(err) => Err(err),
            None => Ok(mtu),
        }
    }

    async fn discover_all(&self, _id: &str) -> Result<(), TransportError> {
        match self.state.lock().await.discovery_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn read_characteristic(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().await;
        state.calls.reads.push(address);
        match state.reads_until_silent_drop {
            Some(0) => {
                state.reads_until_silent_drop = None;
                state.connected.remove(id);
            }
            Some(left) if state.connected.contains(id) => state.reads_until_silent_drop = Some(left - 1),
            _ => {}
        }
        if !state.connected.contains(id) {
            return Err(TransportError::NotConnected(id.to_string()));
        }
        state
            .values
            .get(&address)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::CharacteristicNotFound(address.to_string())))
    }

    async fn write_without_response(
        &self,
        id: &str,
        _address: CharacteristicAddress,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected.contains(id) {
            return Err(TransportError::NotConnected(id.to_string()));
        }
        state.calls.writes.push(value.to_vec());
        let armed = state.notifications.iter().filter(|tx| !tx.is_closed()).count();
        state.calls.armed_at_write.push(armed);

        if state.drop_on_write {
            state.drop_on_write = false;
            Self::drop_link_locked(&mut state, id);
            return Ok(());
        }

        let frames = state.responses.clone();
        for tx in &state.notifications {
            for frame in &frames {
                let _ = tx.send(frame.clone());
            }
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        id: &str,
        _address: CharacteristicAddress,
    ) -> Result<Subscription<Vec<u8>>, TransportError> {
        let mut state = self.state.lock().await;
        if !state.connected.contains(id) {
            return Err(TransportError::NotConnected(id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for frame in state.unsolicited.drain(..) {
            let _ = tx.send(frame);
        }
        state.notifications.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn is_connected(&self, id: &str) -> bool {
        self.state.lock().await.connected.contains(id)
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.calls.cancels.push(id.to_string());
        if let Some(err) = state.cancel_error.take() {
            return Err(err);
        }
        state.connected.remove(id);
        state.disconnects.remove(id);
        state.notifications.clear();
        Ok(())
    }

    async fn on_disconnected(&self, id: &str) -> Result<Subscription<()>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.disconnects.entry(id.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}
