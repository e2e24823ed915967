//! Bounded discovery of candidate devices.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::device_info::DeviceIdentity;
use crate::error::{ScanError, TransportError};
use crate::transport::{ScanEvent, ScanFilter, Subscription, Transport};

/// Turns raw advertisements into a duplicate free, first-seen ordered device list.
#[derive(Debug, Default)]
pub struct ScanAggregator {
    seen: HashSet<String>,
    devices: Vec<DeviceIdentity>,
}

impl ScanAggregator {
    /// Returns the identity if this is the first named advertisement for its id.
    pub fn observe(&mut self, event: ScanEvent) -> Option<DeviceIdentity> {
        let name = event.name.filter(|name| !name.trim().is_empty())?;
        if !self.seen.insert(event.id.clone()) {
            return None;
        }
        let identity = DeviceIdentity::new(event.id, Some(name));
        self.devices.push(identity.clone());
        Some(identity)
    }

    pub fn devices(&self) -> &[DeviceIdentity] {
        &self.devices
    }
}

/// Devices found during one scan window, yielded as they are discovered.
///
/// Ends when the window elapses or the scan is stopped. A transport error is
/// yielded as the final item.
pub struct ScanStream {
    devices: mpsc::UnboundedReceiver<Result<DeviceIdentity, ScanError>>,
}

impl ScanStream {
    /// Wait for the whole window and return everything found.
    pub async fn collect_devices(mut self) -> Result<Vec<DeviceIdentity>, ScanError> {
        let mut devices = Vec::new();
        while let Some(device) = self.next().await {
            devices.push(device?);
        }
        Ok(devices)
    }
}

impl Stream for ScanStream {
    type Item = Result<DeviceIdentity, ScanError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.devices.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    WindowElapsed,
    Stopped,
    Failed,
}

struct ActiveScan {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Runs at most one scan at a time.
pub struct Scanner<T: Transport> {
    transport: Arc<T>,
    active: Mutex<Option<ActiveScan>>,
}

impl<T: Transport> Scanner<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport, active: Mutex::new(None) }
    }

    pub async fn is_scanning(&self) -> bool {
        self.active.lock().await.as_ref().is_some_and(|scan| !scan.task.is_finished())
    }

    /// Start a scan lasting `window`. Returns `None` if a scan is already running.
    pub async fn start_scan(
        &self,
        window: Duration,
        filter: ScanFilter,
    ) -> Result<Option<ScanStream>, ScanError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|scan| !scan.task.is_finished()) {
            debug!("Scan already running");
            return Ok(None);
        }

        let events = match self.transport.scan(filter).await {
            Ok(events) => events,
            Err(err) => {
                stop_radio(self.transport.as_ref()).await;
                return Err(ScanError::Start(err));
            }
        };

        info!("Scanning for {window:?}");
        let (stop, stopped) = oneshot::channel();
        let (tx, devices) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_scan(Arc::clone(&self.transport), events, window, stopped, tx));
        *active = Some(ActiveScan { stop, task });
        Ok(Some(ScanStream { devices }))
    }

    /// Stop the running scan, if any, and wait until the radio is idle.
    pub async fn stop_scan(&self) {
        let Some(scan) = self.active.lock().await.take() else {
            return;
        };
        let _ = scan.stop.send(());
        if let Err(err) = scan.task.await {
            warn!("Scan task ended abnormally: {err}");
            stop_radio(self.transport.as_ref()).await;
        }
    }
}

async fn stop_radio<T: Transport>(transport: &T) {
    if let Err(err) = transport.stop_scan().await {
        warn!("Failed to stop scanning: {err}");
    }
}

async fn run_scan<T: Transport>(
    transport: Arc<T>,
    mut events: Subscription<Result<ScanEvent, TransportError>>,
    window: Duration,
    mut stopped: oneshot::Receiver<()>,
    devices: mpsc::UnboundedSender<Result<DeviceIdentity, ScanError>>,
) {
    let mut aggregator = ScanAggregator::default();
    let timer = sleep(window);
    tokio::pin!(timer);

    let end = loop {
        tokio::select! {
            _ = &mut timer => break ScanEnd::WindowElapsed,
            _ = &mut stopped => break ScanEnd::Stopped,
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if let Some(identity) = aggregator.observe(event) {
                        debug!("Found {} ({:?})", identity.id, identity.name);
                        if devices.send(Ok(identity)).is_err() {
                            break ScanEnd::Stopped;
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!("Scan failed: {err}");
                    let _ = devices.send(Err(ScanError::Aborted(err)));
                    break ScanEnd::Failed;
                }
                None => break ScanEnd::WindowElapsed,
            },
        }
    };

    events.cancel();
    stop_radio(transport.as_ref()).await;
    info!("Scan ended ({end:?}), {} device(s) found", aggregator.devices().len());
}

#[cfg(test)]
use crate::fake_transport::FakeTransport;

#[cfg(test)]
fn event(id: &str, name: Option<&str>) -> Result<ScanEvent, TransportError> {
    Ok(ScanEvent { id: id.to_string(), name: name.map(str::to_string) })
}

#[test]
fn aggregator_dedups_in_first_seen_order() {
    let mut aggregator = ScanAggregator::default();
    for (id, name) in [("B", "Meter B"), ("A", "Meter A"), ("B", "Meter B"), ("A", "Renamed"), ("C", "Meter C")] {
        aggregator.observe(ScanEvent { id: id.into(), name: Some(name.into()) });
    }
    let ids: Vec<_> = aggregator.devices().iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["B", "A", "C"]);
    assert_eq!(aggregator.devices()[1].name.as_deref(), Some("Meter A"));
}

#[test]
fn aggregator_skips_unnamed_devices() {
    let mut aggregator = ScanAggregator::default();
    assert!(aggregator.observe(ScanEvent { id: "A".into(), name: None }).is_none());
    assert!(aggregator.observe(ScanEvent { id: "B".into(), name: Some("  ".into()) }).is_none());
    // A name may only show up in a later advertisement
    assert!(aggregator.observe(ScanEvent { id: "A".into(), name: Some("Meter".into()) }).is_some());
}

#[tokio::test]
async fn scan_yields_each_device_once() {
    let fake = Arc::new(FakeTransport::new());
    fake.script_scan(vec![
        event("A", Some("Meter A")),
        event("A", Some("Meter A")),
        event("B", None),
        event("C", Some("Meter C")),
        event("A", Some("Meter A")),
    ])
    .await;
    let scanner = Scanner::new(Arc::clone(&fake));

    let stream = scanner
        .start_scan(Duration::from_millis(50), ScanFilter::default())
        .await
        .unwrap()
        .unwrap();
    let devices = stream.collect_devices().await.unwrap();

    let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["A", "C"]);
    assert_eq!(fake.calls().await.stop_scans, 1);
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let fake = Arc::new(FakeTransport::new());
    let scanner = Scanner::new(Arc::clone(&fake));

    let first = scanner.start_scan(Duration::from_secs(20), ScanFilter::default()).await.unwrap();
    let second = scanner.start_scan(Duration::from_secs(20), ScanFilter::default()).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(fake.calls().await.scans, 1);
    scanner.stop_scan().await;
}

#[tokio::test]
async fn scan_error_ends_early_and_stops_radio() {
    let fake = Arc::new(FakeTransport::new());
    fake.script_scan(vec![
        event("A", Some("Meter A")),
        Err(TransportError::Platform("adapter powered off".into())),
        event("B", Some("Meter B")),
    ])
    .await;
    let scanner = Scanner::new(Arc::clone(&fake));

    let mut stream = scanner
        .start_scan(Duration::from_secs(20), ScanFilter::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().id, "A");
    assert!(matches!(stream.next().await, Some(Err(ScanError::Aborted(_)))));
    assert!(stream.next().await.is_none());
    assert_eq!(fake.calls().await.stop_scans, 1);
}

#[tokio::test]
async fn start_failure_still_stops_radio() {
    let fake = Arc::new(FakeTransport::new());
    fake.fail_scan(TransportError::Platform("no adapter".into())).await;
    let scanner = Scanner::new(Arc::clone(&fake));

    let result = scanner.start_scan(Duration::from_secs(20), ScanFilter::default()).await;

    assert!(matches!(result, Err(ScanError::Start(_))));
    assert_eq!(fake.calls().await.stop_scans, 1);
}

#[tokio::test]
async fn stop_is_idempotent_and_allows_restart() {
    let fake = Arc::new(FakeTransport::new());
    let scanner = Scanner::new(Arc::clone(&fake));

    let mut stream = scanner
        .start_scan(Duration::from_secs(20), ScanFilter::default())
        .await
        .unwrap()
        .unwrap();
    fake.advertise(event("A", Some("Meter A"))).await;
    assert_eq!(stream.next().await.unwrap().unwrap().id, "A");

    scanner.stop_scan().await;
    scanner.stop_scan().await;
    assert!(stream.next().await.is_none());
    assert!(!scanner.is_scanning().await);
    assert_eq!(fake.calls().await.stop_scans, 1);

    let restarted = scanner.start_scan(Duration::from_secs(20), ScanFilter::default()).await.unwrap();
    assert!(restarted.is_some());
    scanner.stop_scan().await;
}
