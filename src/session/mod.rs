//! Session: one link to one Frame
//!
//! Owns the connection, runs the receive task that feeds the reassembler,
//! and turns the asynchronous notification stream into "send and wait"
//! calls with timeouts.
//!
//! Each channel has a single pending slot and the wire format has no
//! request ids. Callers must not overlap waits on the same channel, and a
//! stray print from the device that lands before the expected reply is
//! taken as the reply.

pub mod slot;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ble::transport::{select_device, BleAddress, BleCentral, BleLink, DeviceFilter};
use crate::ble::BleError;
use crate::config::SessionConfig;
use crate::protocol::reassembly::{Message, Reassembler};
use crate::protocol::{self, Channel, BREAK_SIGNAL, DATA_TAG, RESET_SIGNAL, SERVICE_UUID};

pub use slot::{PendingResponse, ResponseSlot};

pub type TextHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Callbacks installed at connect time. They run on the receive task for
/// every completed message, whether or not anyone is waiting, and are put
/// back to no-ops when the link goes away.
#[derive(Clone)]
pub struct Handlers {
    pub on_text: TextHandler,
    pub on_data: DataHandler,
    pub on_disconnect: DisconnectHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            on_text: Arc::new(|_| {}),
            on_data: Arc::new(|_| {}),
            on_disconnect: Arc::new(|| {}),
        }
    }
}

impl Handlers {
    pub fn on_text(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_text = Arc::new(handler);
        self
    }

    pub fn on_data(mut self, handler: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_data = Arc::new(handler);
        self
    }

    pub fn on_disconnect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Arc::new(handler);
        self
    }
}

struct Connection {
    id: u64,
    link: Arc<dyn BleLink>,
    receiver: JoinHandle<()>,
}

/// State shared between the session and its receive task.
struct Shared {
    config: SessionConfig,
    connection: Mutex<Option<Connection>>,
    next_connection_id: AtomicU64,
    connected: AtomicBool,
    mtu: AtomicUsize,
    handlers: RwLock<Handlers>,
    text: ResponseSlot<String>,
    data: ResponseSlot<Vec<u8>>,
}

impl Shared {
    async fn receive_loop(self: Arc<Self>, id: u64, link: Arc<dyn BleLink>) {
        let mut reassembler = Reassembler::new(self.config.max_reassembly_bytes);
        loop {
            match link.recv().await {
                Ok(frame) => self.dispatch(&mut reassembler, &frame).await,
                Err(BleError::Disconnected) => break,
                Err(e) => {
                    log::warn!("Recv error from {}: {}", link.peer_address(), e);
                    break;
                }
            }
        }

        // Only tear down if nobody else already did (explicit disconnect).
        let lost = {
            let mut connection = self.connection.lock().await;
            if connection.as_ref().is_some_and(|c| c.id == id) {
                connection.take()
            } else {
                None
            }
        };
        if lost.is_some() {
            log::warn!("Link to {} lost", link.peer_address());
            self.teardown();
        }
    }

    async fn dispatch(&self, reassembler: &mut Reassembler, frame: &[u8]) {
        log::trace!("rx {}", hex::encode(frame));
        match reassembler.feed(frame) {
            Ok(None) => {}
            Ok(Some(Message::Text(text))) => {
                self.text.complete(text.clone());
                (self.handlers().on_text)(&text);
            }
            Ok(Some(Message::Data(data))) => {
                self.data.complete(data.clone());
                (self.handlers().on_data)(&data);
            }
            Err(err) => {
                log::warn!("Dropping {} transfer: {}", err.channel(), err);
                match err.channel() {
                    Channel::Text => self.text.fail(err.into()),
                    Channel::Data => self.data.fail(err.into()),
                }
            }
        }
    }

    fn handlers(&self) -> Handlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_handlers(&self, handlers: Handlers) -> Handlers {
        let mut current = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, handlers)
    }

    /// Run the disconnect callback, then clear every piece of per-link
    /// state. Waiters are woken with `BleError::Disconnected`.
    fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.mtu.store(0, Ordering::SeqCst);

        let handlers = self.set_handlers(Handlers::default());
        (handlers.on_disconnect)();

        self.text.disconnect();
        self.data.disconnect();
    }
}

/// A host-side session with at most one Frame at a time.
pub struct Session {
    central: Arc<dyn BleCentral>,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(central: Arc<dyn BleCentral>, config: SessionConfig) -> Self {
        Self {
            central,
            shared: Arc::new(Shared {
                config,
                connection: Mutex::new(None),
                next_connection_id: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                mtu: AtomicUsize::new(0),
                handlers: RwLock::new(Handlers::default()),
                text: ResponseSlot::new(),
                data: ResponseSlot::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Discover devices advertising the Frame service, connect to the
    /// strongest one passing `filter`, and start receiving notifications.
    ///
    /// Returns the address of the device connected to; it can be passed
    /// back as a [`DeviceFilter::Address`] to reconnect to the same device.
    pub async fn connect(
        &self,
        filter: &DeviceFilter,
        handlers: Handlers,
    ) -> Result<BleAddress, BleError> {
        let mut connection = self.shared.connection.lock().await;
        if connection.is_some() {
            return Err(BleError::LinkError("Already connected".to_string()));
        }

        let advertisements = self
            .central
            .discover(SERVICE_UUID, self.shared.config.scan_duration())
            .await?;
        let address = select_device(&advertisements, &SERVICE_UUID, filter)
            .ok_or(BleError::DiscoveryFailed)?
            .source_address
            .clone();

        let link: Arc<dyn BleLink> = Arc::from(self.central.connect(&address).await?);

        self.shared.set_handlers(handlers);
        self.shared.mtu.store(link.mtu(), Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let receiver = tokio::spawn(Arc::clone(&self.shared).receive_loop(id, Arc::clone(&link)));
        *connection = Some(Connection { id, link, receiver });

        log::debug!(
            "Connected to {} (mtu {})",
            address,
            self.shared.mtu.load(Ordering::SeqCst)
        );
        Ok(address)
    }

    /// Disconnect from the device. Does nothing when already disconnected.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        let connection = self.shared.connection.lock().await.take();
        let Some(connection) = connection else {
            return Ok(());
        };
        connection.receiver.abort();
        let result = connection.link.disconnect().await;
        self.shared.teardown();
        log::debug!("Disconnected from {}", connection.link.peer_address());
        result
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Longest script string that fits in one frame; 0 when disconnected.
    pub fn max_text_payload(&self) -> usize {
        protocol::max_text_payload(self.shared.mtu.load(Ordering::SeqCst))
    }

    /// Longest raw data payload that fits in one frame; 0 when disconnected.
    pub fn max_data_payload(&self) -> usize {
        protocol::max_data_payload(self.shared.mtu.load(Ordering::SeqCst))
    }

    /// Default wait timeout for this session.
    pub fn response_timeout(&self) -> Duration {
        self.shared.config.response_timeout()
    }

    async fn link(&self) -> Result<Arc<dyn BleLink>, BleError> {
        self.shared
            .connection
            .lock()
            .await
            .as_ref()
            .map(|c| Arc::clone(&c.link))
            .ok_or(BleError::NotConnected)
    }

    /// Write one frame as is.
    pub async fn transmit(&self, frame: &[u8]) -> Result<(), BleError> {
        let link = self.link().await?;
        let limit = self.max_text_payload();
        if frame.len() > limit {
            return Err(BleError::PayloadTooLarge {
                size: frame.len(),
                limit,
            });
        }
        if self.shared.config.echo_transmit {
            log::info!("tx {}", hex::encode(frame));
        } else {
            log::debug!("tx {}", hex::encode(frame));
        }
        link.write(frame).await
    }

    /// Arm a wait on the text channel before triggering the remote action
    /// that will print.
    pub fn expect_text(&self) -> Result<PendingResponse<String>, BleError> {
        if !self.is_connected() {
            return Err(BleError::NotConnected);
        }
        Ok(self.shared.text.arm())
    }

    /// Arm a wait on the data channel before triggering the remote action
    /// that will send.
    pub fn expect_data(&self) -> Result<PendingResponse<Vec<u8>>, BleError> {
        if !self.is_connected() {
            return Err(BleError::NotConnected);
        }
        Ok(self.shared.data.arm())
    }

    /// Send a script string. With `await_result` the call returns the next
    /// print, or `BleError::NoResponse` after `timeout` (session default
    /// when `None`).
    pub async fn send_text(
        &self,
        payload: &str,
        await_result: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, BleError> {
        let pending = if await_result {
            Some(self.expect_text()?)
        } else {
            None
        };
        self.transmit(payload.as_bytes()).await?;
        match pending {
            Some(pending) => {
                let reply = pending
                    .wait(timeout.unwrap_or_else(|| self.response_timeout()))
                    .await?;
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    /// Send raw bytes on the data channel. With `await_result` the call
    /// returns the next data message from the device.
    pub async fn send_data(
        &self,
        payload: &[u8],
        await_result: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, BleError> {
        let pending = if await_result {
            Some(self.expect_data()?)
        } else {
            None
        };
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(DATA_TAG);
        frame.extend_from_slice(payload);
        self.transmit(&frame).await?;
        match pending {
            Some(pending) => {
                let reply = pending
                    .wait(timeout.unwrap_or_else(|| self.response_timeout()))
                    .await?;
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    /// Wait for the next print without sending anything.
    pub async fn wait_for_text(&self, timeout: Option<Duration>) -> Result<String, BleError> {
        self.expect_text()?
            .wait(timeout.unwrap_or_else(|| self.response_timeout()))
            .await
    }

    /// Wait for the next data message without sending anything.
    pub async fn wait_for_data(&self, timeout: Option<Duration>) -> Result<Vec<u8>, BleError> {
        self.expect_data()?
            .wait(timeout.unwrap_or_else(|| self.response_timeout()))
            .await
    }

    /// The most recent print, if any arrived on this link.
    pub fn last_text(&self) -> Option<String> {
        self.shared.text.last()
    }

    /// The most recent data message, if any arrived on this link.
    pub fn last_data(&self) -> Option<Vec<u8>> {
        self.shared.data.last()
    }

    /// Interrupt the script currently running on the device.
    pub async fn send_break_signal(&self) -> Result<(), BleError> {
        self.transmit(&[BREAK_SIGNAL]).await
    }

    /// Reset the device's scripting VM.
    pub async fn send_reset_signal(&self) -> Result<(), BleError> {
        self.transmit(&[RESET_SIGNAL]).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut connection) = self.shared.connection.try_lock() {
            if let Some(connection) = connection.take() {
                connection.receiver.abort();
            }
        }
    }
}
