//! Connection lifecycle for the single active metering device.
//!
//! ```text
//! Idle -> Connecting -> NegotiatingMtu -> DiscoveringServices -> Ready
//! Ready -> Disconnecting -> Idle        (explicit disconnect)
//! Ready -> Idle                         (link lost)
//! any non-Idle -> Failed
//! ```
//!
//! State changing operations are serialized by one lock. The current [`Link`] is
//! published on a watch channel so an in-flight read notices link loss at its
//! next suspend point without taking the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::device_info::DeviceIdentity;
use crate::error::{ConnectError, DiscoveryError, DisconnectError, FetchError};
use crate::transport::{Subscription, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    NegotiatingMtu,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Failed,
}

/// What the state machine currently knows about the radio link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Device of the current or most recent link. Cleared by an explicit disconnect.
    pub device_id: Option<String>,
    pub state: ConnectionState,
    /// Incremented for every connection attempt
    pub epoch: u64,
    pub mtu: Option<u16>,
    pub services_discovered: bool,
}

impl Link {
    fn idle() -> Self {
        Self {
            device_id: None,
            state: ConnectionState::Idle,
            epoch: 0,
            mtu: None,
            services_discovered: false,
        }
    }
}

/// Handle to one established connection.
///
/// A session stays valid until its link goes away; after that every operation
/// through it fails with [`FetchError::StaleConnection`].
#[derive(Debug, Clone)]
pub struct Session {
    identity: DeviceIdentity,
    epoch: u64,
    link: watch::Receiver<Link>,
}

impl Session {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        let link = self.link.borrow();
        if link.epoch == self.epoch {
            link.state
        } else {
            ConnectionState::Idle
        }
    }

    pub fn mtu(&self) -> Option<u16> {
        let link = self.link.borrow();
        (link.epoch == self.epoch).then_some(link.mtu).flatten()
    }

    pub fn services_discovered(&self) -> bool {
        let link = self.link.borrow();
        link.epoch == self.epoch && link.services_discovered
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub(crate) fn stale(&self) -> FetchError {
        FetchError::StaleConnection { device_id: self.identity.id.clone() }
    }

    /// Fail with `StaleConnection` unless the session is still `Ready`.
    pub(crate) fn check_ready(&self) -> Result<(), FetchError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(self.stale())
        }
    }

    /// Resolves once this session is no longer `Ready`.
    pub(crate) async fn invalidated(&self) {
        let mut link = self.link.clone();
        loop {
            {
                let current = link.borrow_and_update();
                if current.epoch != self.epoch || current.state != ConnectionState::Ready {
                    return;
                }
            }
            if link.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Active {
    identity: DeviceIdentity,
    epoch: u64,
    disconnect_watch: Option<JoinHandle<()>>,
}

struct Shared {
    active: Mutex<Option<Active>>,
    link: watch::Sender<Link>,
    epochs: AtomicU64,
}

impl Shared {
    /// Apply `f` to the link if it still belongs to `epoch`.
    fn update(&self, epoch: u64, f: impl FnOnce(&mut Link)) -> bool {
        self.link.send_if_modified(|link| {
            if link.epoch != epoch {
                return false;
            }
            f(link);
            true
        })
    }

    /// Drop the link of `epoch` to `Idle`, keeping the device for a reconnect.
    /// Returns false if it was not live.
    fn mark_lost(&self, epoch: u64) -> bool {
        self.link.send_if_modified(|link| {
            if link.epoch != epoch || link.state == ConnectionState::Idle {
                return false;
            }
            link.state = ConnectionState::Idle;
            link.mtu = None;
            link.services_discovered = false;
            true
        })
    }
}

pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    shared: Arc<Shared>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Self {
        let (link, _) = watch::channel(Link::idle());
        Self {
            transport,
            config,
            shared: Arc::new(Shared { active: Mutex::new(None), link, epochs: AtomicU64::new(0) }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.borrow().state
    }

    /// Observe every link change.
    pub fn watch_state(&self) -> watch::Receiver<Link> {
        self.shared.link.subscribe()
    }

    /// Connect to `identity`, tearing down any other session first.
    pub async fn connect(&self, identity: DeviceIdentity) -> Result<Session, ConnectError> {
        let mut active = self.shared.active.lock().await;
        self.open(&mut active, identity).await
    }

    /// Disconnect `session`. Does nothing if it is already gone.
    pub async fn disconnect(&self, session: &Session) -> Result<(), DisconnectError> {
        let mut active = self.shared.active.lock().await;
        match active.take() {
            Some(current) if current.epoch == session.epoch => self.teardown(current, true).await,
            other => {
                debug!("{} is already disconnected", session.identity.id);
                *active = other;
                Ok(())
            }
        }
    }

    /// Tear down whatever session is active.
    pub async fn disconnect_all(&self) -> Result<(), DisconnectError> {
        let mut active = self.shared.active.lock().await;
        match active.take() {
            Some(current) => self.teardown(current, true).await,
            None => Ok(()),
        }
    }

    /// A session for the same device that is `Ready` right now.
    ///
    /// If the link behind `session` was lost without being asked to, one
    /// reconnect-and-rediscover cycle is attempted before giving up.
    pub async fn ensure_ready(&self, session: &Session) -> Result<Session, FetchError> {
        let id = &session.identity.id;
        if session.is_ready() && self.transport.is_connected(id).await {
            return Ok(session.clone());
        }

        let mut active = self.shared.active.lock().await;

        // Someone else may have reconnected while we waited for the lock.
        if let Some(current) = active.as_ref().filter(|a| &a.identity.id == id) {
            let current = self.session_for(current);
            if current.is_ready() && self.transport.is_connected(id).await {
                return Ok(current);
            }
        }

        if self.shared.link.borrow().device_id.as_ref() != Some(id) {
            return Err(session.stale());
        }

        warn!("Connection to {id} is stale, reconnecting");
        self.open(&mut active, session.identity.clone()).await.map_err(|err| {
            warn!("Reconnecting to {id} failed: {err}");
            session.stale()
        })
    }

    /// Record that the link behind `session` went away before the transport
    /// reported it. The next [`ensure_ready`](Self::ensure_ready) reconnects.
    pub async fn link_lost(&self, session: &Session) {
        let id = &session.identity.id;
        let mut active = self.shared.active.lock().await;
        if !active.as_ref().is_some_and(|a| a.epoch == session.epoch) {
            return;
        }
        if self.transport.is_connected(id).await {
            debug!("{id} is still connected");
            return;
        }

        if let Some(lost) = active.take() {
            if let Some(watch) = lost.disconnect_watch {
                watch.abort();
            }
        }
        if self.shared.mark_lost(session.epoch) {
            warn!("Link to {id} lost unexpectedly");
        }
    }

    fn session_for(&self, active: &Active) -> Session {
        Session {
            identity: active.identity.clone(),
            epoch: active.epoch,
            link: self.shared.link.subscribe(),
        }
    }

    async fn open(
        &self,
        active: &mut Option<Active>,
        identity: DeviceIdentity,
    ) -> Result<Session, ConnectError> {
        if let Some(previous) = active.take() {
            info!("Closing {} before connecting to {}", previous.identity.id, identity.id);
            if let Err(err) = self.teardown(previous, false).await {
                warn!("{err}");
            }
        }

        let id = identity.id.clone();
        let epoch = self.shared.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.link.send_replace(Link {
            device_id: Some(id.clone()),
            state: ConnectionState::Connecting,
            epoch,
            mtu: None,
            services_discovered: false,
        });

        info!("Connecting to {id}");
        if let Err(source) = self.transport.connect(&id).await {
            error!("Failed to connect to {id}: {source}");
            self.fail(&id, epoch).await;
            return Err(ConnectError::Connect { device_id: id, source });
        }

        self.shared.update(epoch, |link| link.state = ConnectionState::NegotiatingMtu);
        match self.transport.request_mtu(&id, self.config.mtu).await {
            Ok(mtu) => {
                debug!("MTU for {id} is {mtu}");
                self.shared.update(epoch, |link| link.mtu = Some(mtu));
            }
            Err(err) => warn!("MTU negotiation with {id} failed, continuing: {err}"),
        }

        self.shared.update(epoch, |link| link.state = ConnectionState::DiscoveringServices);
        if let Err(source) = self.transport.discover_all(&id).await {
            error!("Service discovery on {id} failed: {source}");
            self.fail(&id, epoch).await;
            return Err(DiscoveryError { device_id: id, source }.into());
        }

        let disconnects = self
            .transport
            .on_disconnected(&id)
            .await
            .map_err(|err| warn!("Cannot watch {id} for link loss: {err}"))
            .ok();

        self.shared.update(epoch, |link| {
            link.state = ConnectionState::Ready;
            link.services_discovered = true;
        });
        info!("Connected to {id}");

        // Registered before Ready, so a drop in between is still delivered.
        let disconnect_watch = disconnects
            .map(|events| tokio::spawn(watch_disconnects(Arc::clone(&self.shared), epoch, events)));

        let opened = Active { identity, epoch, disconnect_watch };
        let session = self.session_for(&opened);
        *active = Some(opened);
        Ok(session)
    }

    /// Release a half open link after a failed attempt.
    async fn fail(&self, id: &str, epoch: u64) {
        if let Err(err) = self.transport.cancel_connection(id).await {
            debug!("Cleanup of {id} after failure: {err}");
        }
        self.shared.update(epoch, |link| {
            link.state = ConnectionState::Failed;
            link.services_discovered = false;
        });
    }

    /// Runs every cleanup step even when the transport refuses to disconnect.
    async fn teardown(&self, active: Active, forget_device: bool) -> Result<(), DisconnectError> {
        let id = active.identity.id;
        if let Some(watch) = active.disconnect_watch {
            watch.abort();
        }
        self.shared.update(active.epoch, |link| link.state = ConnectionState::Disconnecting);

        let result = if self.transport.is_connected(&id).await {
            self.transport
                .cancel_connection(&id)
                .await
                .map_err(|source| DisconnectError { device_id: id.clone(), source })
        } else {
            debug!("{id} already dropped the link");
            Ok(())
        };

        self.shared.update(active.epoch, |link| {
            link.state = ConnectionState::Idle;
            link.mtu = None;
            link.services_discovered = false;
            if forget_device {
                link.device_id = None;
            }
        });
        info!("Disconnected from {id}");
        result
    }
}

async fn watch_disconnects(shared: Arc<Shared>, epoch: u64, mut events: Subscription<()>) {
    if events.next().await.is_none() {
        return;
    }

    if shared.mark_lost(epoch) {
        warn!("Link lost unexpectedly");
    }

    let mut active = shared.active.lock().await;
    if active.as_ref().is_some_and(|a| a.epoch == epoch) {
        *active = None;
    }
}

#[cfg(test)]
use crate::error::TransportError;
#[cfg(test)]
use crate::fake_transport::FakeTransport;

#[cfg(test)]
fn manager(fake: &Arc<FakeTransport>) -> ConnectionManager<FakeTransport> {
    ConnectionManager::new(Arc::clone(fake), ClientConfig::default())
}

#[tokio::test]
async fn connect_walks_to_ready() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);

    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(session.mtu(), Some(250));
    assert!(session.services_discovered());
    assert_eq!(connections.state(), ConnectionState::Ready);
    assert_eq!(fake.calls().await.mtu_requests, vec![250]);
}

#[tokio::test]
async fn mtu_failure_is_not_fatal() {
    let fake = Arc::new(FakeTransport::new());
    fake.fail_mtu(TransportError::Unsupported("MTU negotiation")).await;
    let connections = manager(&fake);

    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    assert!(session.is_ready());
    assert_eq!(session.mtu(), None);
}

#[tokio::test]
async fn connect_failure_moves_to_failed() {
    let fake = Arc::new(FakeTransport::new());
    fake.fail_connect(TransportError::Platform("out of range".into())).await;
    let connections = manager(&fake);

    let err = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap_err();

    assert!(matches!(err, ConnectError::Connect { ref device_id, .. } if device_id == "AA"));
    assert_eq!(connections.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn discovery_failure_moves_to_failed() {
    let fake = Arc::new(FakeTransport::new());
    fake.fail_discovery(TransportError::Platform("gatt error 133".into())).await;
    let connections = manager(&fake);

    let err = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap_err();

    assert!(matches!(err, ConnectError::Discovery(_)));
    assert_eq!(connections.state(), ConnectionState::Failed);
    assert_eq!(fake.calls().await.cancels, vec!["AA".to_string()]);
}

#[tokio::test]
async fn connecting_elsewhere_tears_down_first() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);

    let first = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();
    let second = connections.connect(DeviceIdentity::new("BB", None)).await.unwrap();

    assert_eq!(first.state(), ConnectionState::Idle);
    assert!(second.is_ready());
    let calls = fake.calls().await;
    assert_eq!(calls.cancels, vec!["AA".to_string()]);
    assert_eq!(calls.connects, vec!["AA".to_string(), "BB".to_string()]);
}

#[tokio::test]
async fn unsolicited_disconnect_goes_idle() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    fake.drop_link("AA").await;
    session.invalidated().await;

    assert_eq!(session.state(), ConnectionState::Idle);
    assert_eq!(connections.state(), ConnectionState::Idle);
    assert!(session.check_ready().is_err());
}

#[tokio::test]
async fn disconnect_twice_cancels_once() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    connections.disconnect(&session).await.unwrap();
    connections.disconnect(&session).await.unwrap();

    assert_eq!(fake.calls().await.cancels, vec!["AA".to_string()]);
    assert_eq!(connections.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn disconnect_skips_cancel_when_link_already_down() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    fake.set_connected("AA", false).await;
    connections.disconnect(&session).await.unwrap();

    assert!(fake.calls().await.cancels.is_empty());
    assert_eq!(session.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn failed_disconnect_still_cleans_up() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    fake.fail_cancel(TransportError::Platform("busy".into())).await;
    let err = connections.disconnect(&session).await.unwrap_err();

    assert_eq!(err.device_id, "AA");
    assert_eq!(connections.state(), ConnectionState::Idle);
    assert!(connections.disconnect(&session).await.is_ok());
}

#[tokio::test]
async fn ensure_ready_reconnects_once_after_link_loss() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    fake.drop_link("AA").await;
    session.invalidated().await;
    let fresh = connections.ensure_ready(&session).await.unwrap();

    assert!(fresh.is_ready());
    assert!(!session.is_ready());
    assert_eq!(fake.calls().await.connects.len(), 2);
}

#[tokio::test]
async fn ensure_ready_gives_up_after_one_attempt() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    fake.set_connected("AA", false).await;
    fake.fail_connect(TransportError::Platform("out of range".into())).await;
    let err = connections.ensure_ready(&session).await.unwrap_err();

    assert_eq!(err, FetchError::StaleConnection { device_id: "AA".into() });
    assert_eq!(fake.calls().await.connects.len(), 2);
}

#[tokio::test]
async fn ensure_ready_does_not_revive_explicit_disconnect() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    connections.disconnect(&session).await.unwrap();
    let err = connections.ensure_ready(&session).await.unwrap_err();

    assert!(matches!(err, FetchError::StaleConnection { .. }));
    assert_eq!(fake.calls().await.connects.len(), 1);
}

#[tokio::test]
async fn link_lost_ahead_of_event_goes_idle_and_reconnects() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    fake.set_connected("AA", false).await;
    connections.link_lost(&session).await;

    assert_eq!(connections.state(), ConnectionState::Idle);
    assert!(!session.is_ready());
    let fresh = connections.ensure_ready(&session).await.unwrap();
    assert!(fresh.is_ready());
    assert_eq!(fake.calls().await.connects.len(), 2);
}

#[tokio::test]
async fn link_lost_leaves_live_link_alone() {
    let fake = Arc::new(FakeTransport::new());
    let connections = manager(&fake);
    let session = connections.connect(DeviceIdentity::new("AA", None)).await.unwrap();

    connections.link_lost(&session).await;

    assert!(session.is_ready());
    assert_eq!(connections.state(), ConnectionState::Ready);
}
