// Framelink - host side link to Brilliant Labs Frame glasses over BLE

pub mod ble;
pub mod config;
pub mod files;
pub mod frame;
pub mod protocol;
pub mod script;
pub mod session;

pub use ble::transport::{BleAddress, BleCentral, BleLink, DeviceFilter};
pub use ble::BleError;
pub use config::SessionConfig;
pub use files::RemoteFiles;
pub use frame::Frame;
pub use session::{Handlers, Session};
