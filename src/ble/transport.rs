//! BLE transport trait definitions and core types
//!
//! Defines the abstract BLE interface that both the simulated network and
//! the btleplug central conform to. The session only ever talks to a
//! [`BleCentral`] for discovery and to a [`BleLink`] once connected.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// Address as reported by the platform stack. On macOS this is a
    /// system generated UUID rather than the device's MAC address.
    Platform(String),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Platform(address) => f.write_str(address),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// A received BLE advertisement.
#[derive(Debug, Clone)]
pub struct BleAdvertisement {
    /// Address of the advertising device.
    pub source_address: BleAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement.
    pub service_uuids: Vec<Uuid>,
}

/// An active link to one device: a single write characteristic going out
/// and a single notify characteristic coming back.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Write one frame to the outbound characteristic.
    async fn write(&self, data: &[u8]) -> Result<(), BleError>;

    /// Receive the next notification. Returns `BleError::Disconnected`
    /// once the link is gone.
    async fn recv(&self) -> Result<Vec<u8>, BleError>;

    /// Tear down the link.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Negotiated ATT MTU.
    fn mtu(&self) -> usize;

    /// Get the peer's BLE address.
    fn peer_address(&self) -> &BleAddress;

    /// Check whether the link is still up.
    fn is_connected(&self) -> bool;
}

/// Resolves once a link's closed flag is set or its owner is gone.
pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Finish setting up a link that is already connected. If `setup` fails,
/// `undo` runs before the error is returned so the device isn't left
/// connected with nobody holding the link.
#[cfg_attr(not(feature = "ble-central"), allow(dead_code))]
pub(crate) async fn setup_or_undo<T, S, U>(setup: S, undo: U) -> Result<T, BleError>
where
    S: Future<Output = Result<T, BleError>>,
    U: Future<Output = ()>,
{
    let result = setup.await;
    if result.is_err() {
        undo.await;
    }
    result
}

/// BLE central role: discovering advertisements and connecting to peripherals.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Scan for `window` and return every advertisement listing `service`.
    async fn discover(
        &self,
        service: Uuid,
        window: Duration,
    ) -> Result<Vec<BleAdvertisement>, BleError>;

    /// Connect to a peripheral, subscribe to its notify characteristic and
    /// resolve its write characteristic.
    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn BleLink>, BleError>;
}

/// Which device to pick among the ones advertising the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Any device; the strongest signal wins.
    #[default]
    Any,
    /// The two character id shown on the device, matched against the end
    /// of the advertised name.
    ShortId(String),
    /// The full platform address.
    Address(String),
}

impl DeviceFilter {
    /// Build a filter from user input: two characters is a short id,
    /// anything longer is an address.
    pub fn parse(value: &str) -> Self {
        match value.len() {
            0 => DeviceFilter::Any,
            2 => DeviceFilter::ShortId(value.to_uppercase()),
            _ => DeviceFilter::Address(value.to_string()),
        }
    }

    pub fn matches(&self, adv: &BleAdvertisement) -> bool {
        match self {
            DeviceFilter::Any => true,
            DeviceFilter::ShortId(id) => adv
                .name
                .as_deref()
                .map(|name| name.to_uppercase().ends_with(id.as_str()))
                .unwrap_or(false),
            DeviceFilter::Address(address) => adv.source_address.to_string() == *address,
        }
    }
}

/// Pick the advertisement to connect to: it must list `service` and pass
/// `filter`; among those the strongest RSSI wins. Missing RSSI sorts last.
pub fn select_device<'a>(
    advertisements: &'a [BleAdvertisement],
    service: &Uuid,
    filter: &DeviceFilter,
) -> Option<&'a BleAdvertisement> {
    advertisements
        .iter()
        .filter(|adv| adv.service_uuids.contains(service))
        .filter(|adv| filter.matches(adv))
        .max_by_key(|adv| adv.rssi.unwrap_or(i16::MIN))
}
