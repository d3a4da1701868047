//! Simulated BLE air for driving a Frame session without hardware
//!
//! Peripherals advertise on a shared in-memory network and a central
//! discovers and links to them. Each link is a pair of mpsc queues with a
//! shared closed flag, so either side can drop the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use super::transport::{wait_closed, BleAddress, BleAdvertisement, BleCentral, BleLink};
use super::BleError;
use crate::protocol::ATT_OVERHEAD;

/// Default MTU for simulated peripherals.
pub const DEFAULT_SIM_MTU: usize = 247;

/// Everything the "air" knows about an advertising peripheral.
struct Registration {
    advertisement: BleAdvertisement,
    conn_tx: mpsc::Sender<SimBleLink>,
    mtu: usize,
    latency: Duration,
    requires_pairing: bool,
}

/// The simulated "air" through which the central and all simulated
/// peripherals communicate.
pub struct SimBleNetwork {
    /// Registry of advertising peripherals keyed by address.
    peripherals: Mutex<HashMap<BleAddress, Registration>>,
}

impl SimBleNetwork {
    /// Empty network with nothing advertising.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Create a new simulated peripheral on this network. It is not
    /// discoverable until it starts advertising.
    pub fn create_peripheral(self: &Arc<Self>, name: impl Into<String>) -> SimPeripheral {
        let (conn_tx, conn_rx) = mpsc::channel(4);
        SimPeripheral {
            address: BleAddress::Simulated(Uuid::new_v4()),
            network: Arc::clone(self),
            name: name.into(),
            rssi: -50,
            mtu: DEFAULT_SIM_MTU,
            latency: Duration::ZERO,
            requires_pairing: false,
            conn_tx,
            conn_rx: Mutex::new(conn_rx),
        }
    }

    /// A central attached to this network.
    pub fn central(self: &Arc<Self>) -> SimCentral {
        SimCentral {
            address: BleAddress::Simulated(Uuid::new_v4()),
            network: Arc::clone(self),
        }
    }
}

/// A simulated peripheral: the device side of the link.
pub struct SimPeripheral {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
    name: String,
    rssi: i16,
    mtu: usize,
    /// Simulated link-layer latency applied to each write.
    latency: Duration,
    requires_pairing: bool,
    conn_tx: mpsc::Sender<SimBleLink>,
    conn_rx: Mutex<mpsc::Receiver<SimBleLink>>,
}

impl SimPeripheral {
    /// Address the central sees in advertisements.
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    /// Set the MTU negotiated by links to this device.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Set the advertised signal strength.
    pub fn set_rssi(&mut self, rssi: i16) {
        self.rssi = rssi;
    }

    /// Set the simulated link-layer latency for links to this device.
    /// Uses tokio virtual time, so paused clocks advance instantly in tests.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Make connection attempts fail the way a device with stale bonding
    /// information does.
    pub fn set_requires_pairing(&mut self, requires_pairing: bool) {
        self.requires_pairing = requires_pairing;
    }

    /// Start advertising the given services and accepting connections.
    pub async fn start_advertising(&self, service_uuids: Vec<Uuid>) {
        let registration = Registration {
            advertisement: BleAdvertisement {
                source_address: self.address.clone(),
                name: Some(self.name.clone()),
                rssi: Some(self.rssi),
                service_uuids,
            },
            conn_tx: self.conn_tx.clone(),
            mtu: self.mtu,
            latency: self.latency,
            requires_pairing: self.requires_pairing,
        };
        let mut peripherals = self.network.peripherals.lock().await;
        peripherals.insert(self.address.clone(), registration);
    }

    /// Stop advertising.
    pub async fn stop_advertising(&self) {
        let mut peripherals = self.network.peripherals.lock().await;
        peripherals.remove(&self.address);
    }

    /// Accept the next incoming link from a central.
    pub async fn accept(&self) -> Result<SimBleLink, BleError> {
        let mut rx = self.conn_rx.lock().await;
        rx.recv().await.ok_or(BleError::Disconnected)
    }
}

/// A simulated central.
pub struct SimCentral {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
}

#[async_trait]
impl BleCentral for SimCentral {
    async fn discover(
        &self,
        service: Uuid,
        _window: Duration,
    ) -> Result<Vec<BleAdvertisement>, BleError> {
        let peripherals = self.network.peripherals.lock().await;
        Ok(peripherals
            .values()
            .map(|r| r.advertisement.clone())
            .filter(|adv| adv.service_uuids.contains(&service))
            .collect())
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn BleLink>, BleError> {
        let (conn_tx, mtu, latency) = {
            let peripherals = self.network.peripherals.lock().await;
            let registration = peripherals
                .get(address)
                .ok_or_else(|| BleError::LinkError(format!("No peripheral at {}", address)))?;

            if registration.requires_pairing {
                return Err(BleError::LinkError("Device needs to be re-paired".to_string()));
            }
            (
                registration.conn_tx.clone(),
                registration.mtu,
                registration.latency,
            )
        };

        let (central_end, peripheral_end) =
            SimBleLink::create_pair(self.address.clone(), address.clone(), mtu, latency);

        conn_tx
            .send(peripheral_end)
            .await
            .map_err(|_| {
                BleError::LinkError("Peripheral is no longer accepting connections".to_string())
            })?;

        Ok(Box::new(central_end))
    }
}

/// One end of a simulated link backed by tokio mpsc channels. The central
/// end writes frames, the peripheral end sends notifications; both are
/// `write` on this type.
pub struct SimBleLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Shared by both ends; `true` once either side disconnects.
    closed: Arc<watch::Sender<bool>>,
    peer_address: BleAddress,
    mtu: usize,
    latency: Duration,
}

impl SimBleLink {
    /// Create a symmetric pair of link ends between two addresses.
    fn create_pair(
        addr_a: BleAddress,
        addr_b: BleAddress,
        mtu: usize,
        latency: Duration,
    ) -> (SimBleLink, SimBleLink) {
        let (tx_ab, rx_ab) = mpsc::channel(256);
        let (tx_ba, rx_ba) = mpsc::channel(256);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let end_a = SimBleLink {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            closed: Arc::clone(&closed),
            peer_address: addr_b,
            mtu,
            latency,
        };

        let end_b = SimBleLink {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            closed,
            peer_address: addr_a,
            mtu,
            latency,
        };

        (end_a, end_b)
    }

    /// Send a notification from the peripheral end.
    pub async fn notify(&self, data: &[u8]) -> Result<(), BleError> {
        self.write(data).await
    }
}

#[async_trait]
impl BleLink for SimBleLink {
    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let limit = self.mtu.saturating_sub(ATT_OVERHEAD);
        if data.len() > limit {
            return Err(BleError::PayloadTooLarge {
                size: data.len(),
                limit,
            });
        }
        // Link-layer delay before the frame lands.
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| BleError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            data = rx.recv() => data.ok_or(BleError::Disconnected),
            _ = wait_closed(closed) => Err(BleError::Disconnected),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn peer_address(&self) -> &BleAddress {
        &self.peer_address
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }
}
