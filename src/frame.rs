//! High level handle to one Frame
//!
//! Wraps a [`Session`] with connect-on-demand, helper installation and
//! a few device conveniences.

use std::sync::Arc;

use crate::ble::transport::{BleAddress, BleCentral, DeviceFilter};
use crate::ble::BleError;
use crate::config::SessionConfig;
use crate::files::RemoteFiles;
use crate::protocol::commands;
use crate::session::{Handlers, Session};

pub struct Frame {
    session: Session,
    filter: DeviceFilter,
    handlers: Handlers,
}

impl Frame {
    pub fn new(central: Arc<dyn BleCentral>, config: SessionConfig) -> Self {
        Self {
            session: Session::new(central, config),
            filter: DeviceFilter::Any,
            handlers: Handlers::default(),
        }
    }

    /// Only connect to devices passing `filter`.
    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Callbacks installed every time the link comes up.
    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn files(&self) -> RemoteFiles<'_> {
        self.session.files()
    }

    /// Connect if not already connected. Returns the device address when a
    /// new link was made.
    pub async fn ensure_connected(&self) -> Result<Option<BleAddress>, BleError> {
        if self.session.is_connected() {
            return Ok(None);
        }
        let address = self
            .session
            .connect(&self.filter, self.handlers.clone())
            .await?;
        log::info!("Connected to Frame at {}", address);
        if self.session.config().inject_library {
            self.session.inject_all_library_functions().await?;
        }
        Ok(Some(address))
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.session.disconnect().await
    }

    /// Run a script of any length. `print` calls are routed through the
    /// long-print helper so their output isn't cut at one notification.
    pub async fn run_lua(&self, source: &str, await_print: bool) -> Result<Option<String>, BleError> {
        self.ensure_connected().await?;
        let source = commands::rewrite_prints(source);
        self.session.run_script(&source, await_print).await
    }

    /// The string form of a script expression evaluated on the device.
    pub async fn evaluate(&self, expression: &str) -> Result<String, BleError> {
        self.run_lua(&commands::evaluate(expression), true)
            .await?
            .ok_or(BleError::NoResponse)
    }

    /// Battery charge in percent.
    pub async fn battery_level(&self) -> Result<u8, BleError> {
        let response = self.evaluate("frame.battery_level()").await?;
        response
            .trim()
            .parse::<f32>()
            .map(|level| level.clamp(0.0, 100.0) as u8)
            .map_err(|_| BleError::UnexpectedResponse {
                expected: "battery level".to_string(),
                received: response,
            })
    }

    /// Put the device to sleep, now or after `seconds`.
    pub async fn sleep(&self, seconds: Option<f32>) -> Result<(), BleError> {
        self.run_lua(&commands::sleep(seconds), false).await?;
        Ok(())
    }

    /// Keep the device awake while it's docked on the charging cradle. Useful
    /// during development.
    pub async fn stay_awake(&self, value: bool) -> Result<(), BleError> {
        self.run_lua(&commands::stay_awake(value), false).await?;
        Ok(())
    }

    pub async fn inject_library_function(&self, name: &str, source: &str) -> Result<(), BleError> {
        self.ensure_connected().await?;
        self.session.inject_library_function(name, source).await
    }

    pub async fn inject_all_library_functions(&self) -> Result<(), BleError> {
        self.ensure_connected().await?;
        self.session.inject_all_library_functions().await
    }
}
