//! Scan for, connect to and read BLE metering devices.
//!
//! The meters expose the standard GAP, Device Information and Battery services
//! together with a vendor service carrying a single control-point characteristic.
//! Values beyond the standard ones are read with a minimal DLMS/COSEM Get-Request
//! written to the control point; the answer comes back as a notification.
//!
//! Currently the following data can be accessed:
//!
//! - Device name, appearance, serial number, firmware version, hardware revision, manufacturer
//! - Battery level (%)
//! - Battery voltage (V)
//! - Cumulative meter readings addressed by OBIS code
//!
//! The radio link is assumed to be unreliable. At most one device is connected
//! at a time; a link that drops mid-request fails the request with
//! [`FetchError::StaleConnection`] instead of returning stale data.
//!
//! # Example
//!
//! ```no_run
//! # use meteread::{ClientConfig, MeterClient};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let client = MeterClient::new_default(ClientConfig::default()).await?;
//!     let devices = client.scan().await?.expect("no scan running").collect_devices().await?;
//!     let session = client.connect(devices[0].clone()).await?;
//!     let snapshot = client.fetch_snapshot(&session).await?;
//!     println!("{snapshot:?}");
//!     client.disconnect(&session).await?;
//! #   Ok(())
//! # }
//! ```

mod bluest_transport;
pub mod catalog;
mod config;
mod connection;
mod device_info;
mod error;
#[cfg(test)]
mod fake_transport;
pub mod message;
mod meter_client;
mod reading;
mod scan;
mod transport;

pub use bluest_transport::BluestTransport;
pub use catalog::{CharacteristicAddress, GattCharacteristic};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, Link, Session};
pub use device_info::{DeviceIdentity, DeviceInfo, DeviceInfoBuilder, MeterSnapshot, MeteringReading};
pub use error::{
    CatalogError, CharacteristicReadError, CodecError, ConnectError, DisconnectError,
    DiscoveryError, FetchError, ScanError, TransportError,
};
pub use message::{ObisCode, PhysicalValue, ResponseKind, Unit};
pub use meter_client::MeterClient;
pub use reading::ReadingSession;
pub use scan::{ScanAggregator, ScanStream, Scanner};
pub use transport::{ScanEvent, ScanFilter, Subscription, Transport};
