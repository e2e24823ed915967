//! The platform BLE stack as seen by the core.
//!
//! Everything that touches the radio goes through [`Transport`]. Asynchronous
//! events (scan results, notifications, link loss) are delivered through a
//! [`Subscription`], which unregisters itself when cancelled or dropped.

use async_trait::async_trait;
use bluest::Uuid;
use tokio::sync::mpsc;

use crate::catalog::CharacteristicAddress;
use crate::error::TransportError;

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services. Empty means all.
    pub services: Vec<Uuid>,
}

/// A registration for events pushed by the transport.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<T>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(events: mpsc::UnboundedReceiver<T>) -> Self {
        Self { events, on_cancel: None }
    }

    /// Run `on_cancel` exactly once when the subscription is cancelled or dropped.
    pub fn with_cancel(mut self, on_cancel: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    /// Wait for the next event. `None` once the transport has closed the registration.
    pub async fn next(&mut self) -> Option<T> {
        self.events.recv().await
    }

    /// An event that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.events.try_recv().ok()
    }

    /// Stop delivery. Safe to call more than once; events sent afterwards are dropped.
    pub fn cancel(&mut self) {
        self.events.close();
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Platform BLE operations, addressed by the transport assigned device id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start discovery. Errors that end the scan are delivered as `Err` events.
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<Subscription<Result<ScanEvent, TransportError>>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &str) -> Result<(), TransportError>;

    /// Returns the MTU actually granted.
    async fn request_mtu(&self, id: &str, mtu: u16) -> Result<u16, TransportError>;

    async fn discover_all(&self, id: &str) -> Result<(), TransportError>;

    async fn read_characteristic(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write_without_response(
        &self,
        id: &str,
        address: CharacteristicAddress,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Arm notifications. Must not return before the CCCD has been written,
    /// so a write issued afterwards cannot race its own response.
    async fn subscribe_notifications(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Subscription<Vec<u8>>, TransportError>;

    async fn is_connected(&self, id: &str) -> bool;

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError>;

    /// Yields one event each time the link to `id` drops without being asked to.
    async fn on_disconnected(&self, id: &str) -> Result<Subscription<()>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<Subscription<Result<ScanEvent, TransportError>>, TransportError> {
        (**self).scan(filter).await
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        (**self).stop_scan().await
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        (**self).connect(id).await
    }

    async fn request_mtu(&self, id: &str, mtu: u16) -> Result<u16, TransportError> {
        (**self).request_mtu(id, mtu).await
    }

    async fn discover_all(&self, id: &str) -> Result<(), TransportError> {
        (**self).discover_all(id).await
    }

    async fn read_characteristic(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).read_characteristic(id, address).await
    }

    async fn write_without_response(
        &self,
        id: &str,
        address: CharacteristicAddress,
        value: &[u8],
    ) -> Result<(), TransportError> {
        (**self).write_without_response(id, address, value).await
    }

    async fn subscribe_notifications(
        &self,
        id: &str,
        address: CharacteristicAddress,
    ) -> Result<Subscription<Vec<u8>>, TransportError> {
        (**self).subscribe_notifications(id, address).await
    }

    async fn is_connected(&self, id: &str) -> bool {
        (**self).is_connected(id).await
    }

    async fn cancel_connection(&self, id: &str) -> Result<(), TransportError> {
        (**self).cancel_connection(id).await
    }

    async fn on_disconnected(&self, id: &str) -> Result<Subscription<()>, TransportError> {
        (**self).on_disconnected(id).await
    }
}
