//! btleplug-backed BLE central
//!
//! Uses the first adapter the platform reports. Notifications from the
//! device are forwarded into a queue by a background task so they can be
//! consumed through [`BleLink::recv`] like any other link.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::transport::{
    setup_or_undo, wait_closed, BleAddress, BleAdvertisement, BleCentral, BleLink,
};
use super::BleError;
use crate::protocol::{RX_CHARACTERISTIC_UUID, TX_CHARACTERISTIC_UUID};

const NOTIFICATION_QUEUE: usize = 256;

fn scan_error(err: btleplug::Error) -> BleError {
    BleError::ScanError(err.to_string())
}

fn link_error(err: btleplug::Error) -> BleError {
    BleError::LinkError(err.to_string())
}

/// Central backed by the host's Bluetooth stack.
pub struct PlatformCentral {
    adapter: Adapter,
    /// btleplug doesn't report the negotiated MTU, so links use this one.
    mtu: usize,
    /// Peripherals seen by the last scan, by platform id.
    seen: Mutex<HashMap<String, Peripheral>>,
}

impl PlatformCentral {
    pub async fn new(mtu: usize) -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(scan_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(scan_error)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ScanError("No Bluetooth adapter found".to_string()))?;
        Ok(Self {
            adapter,
            mtu,
            seen: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl BleCentral for PlatformCentral {
    async fn discover(
        &self,
        service: Uuid,
        window: Duration,
    ) -> Result<Vec<BleAdvertisement>, BleError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(scan_error)?;
        tokio::time::sleep(window).await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("stop_scan failed: {}", e);
        }

        let mut seen = self.seen.lock().await;
        let mut advertisements = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(scan_error)? {
            let Some(properties) = peripheral.properties().await.map_err(scan_error)? else {
                continue;
            };
            let id = peripheral.id().to_string();
            log::trace!(
                "Found {} {:?} rssi {:?}",
                id,
                properties.local_name,
                properties.rssi
            );
            advertisements.push(BleAdvertisement {
                source_address: BleAddress::Platform(id.clone()),
                name: properties.local_name,
                rssi: properties.rssi,
                service_uuids: properties.services,
            });
            seen.insert(id, peripheral);
        }
        Ok(advertisements)
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn BleLink>, BleError> {
        let BleAddress::Platform(id) = address else {
            return Err(BleError::LinkError(format!("{} is not a platform address", address)));
        };
        let peripheral = self
            .seen
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BleError::LinkError(format!("{} was not discovered", id)))?;

        peripheral.connect().await.map_err(link_error)?;
        setup_or_undo(self.open_link(&peripheral, address), async {
            if let Err(e) = peripheral.disconnect().await {
                log::debug!("disconnect after failed link setup: {}", e);
            }
        })
        .await
    }
}

impl PlatformCentral {
    /// Everything after the connection itself: find the characteristics,
    /// subscribe, and start forwarding notifications.
    async fn open_link(
        &self,
        peripheral: &Peripheral,
        address: &BleAddress,
    ) -> Result<Box<dyn BleLink>, BleError> {
        peripheral.discover_services().await.map_err(link_error)?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BleError::GattError(format!("Characteristic {} not found", uuid)))
        };
        let tx = find(TX_CHARACTERISTIC_UUID)?;
        let rx = find(RX_CHARACTERISTIC_UUID)?;

        let mut notifications = peripheral.notifications().await.map_err(link_error)?;
        let mut events = self.adapter.events().await.map_err(link_error)?;
        peripheral.subscribe(&rx).await.map_err(|e| {
            BleError::LinkError(format!("Device needs to be re-paired ({})", e))
        })?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let (queue_tx, queue_rx) = mpsc::channel(NOTIFICATION_QUEUE);

        let forward = {
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != RX_CHARACTERISTIC_UUID {
                        continue;
                    }
                    if queue_tx.send(notification.value).await.is_err() {
                        break;
                    }
                }
                closed.send_replace(true);
            })
        };

        let watch_disconnect = {
            let closed = Arc::clone(&closed);
            let peripheral_id = peripheral.id();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(gone) = event {
                        if gone == peripheral_id {
                            closed.send_replace(true);
                            break;
                        }
                    }
                }
            })
        };

        let write_type = if tx.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        Ok(Box::new(PlatformLink {
            peripheral: peripheral.clone(),
            tx,
            write_type,
            rx: Mutex::new(queue_rx),
            closed,
            address: address.clone(),
            mtu: self.mtu,
            tasks: [forward, watch_disconnect],
        }))
    }
}

/// A connection to one device through the platform stack.
pub struct PlatformLink {
    peripheral: Peripheral,
    tx: Characteristic,
    write_type: WriteType,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
    address: BleAddress,
    mtu: usize,
    tasks: [JoinHandle<()>; 2],
}

#[async_trait]
impl BleLink for PlatformLink {
    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        self.peripheral
            .write(&self.tx, data, self.write_type)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, BleError> {
        let closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            data = rx.recv() => data.ok_or(BleError::Disconnected),
            _ = wait_closed(closed) => Err(BleError::Disconnected),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.closed.send_replace(true);
        self.peripheral.disconnect().await.map_err(link_error)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn peer_address(&self) -> &BleAddress {
        &self.address
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }
}

impl Drop for PlatformLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
