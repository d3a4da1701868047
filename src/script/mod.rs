//! Running scripts and installing helpers on the device
//!
//! The device caps the length of a single command, so scripts that don't
//! fit in one frame are uploaded to a throwaway module and loaded by name.

pub mod library;

use rand::Rng;

use crate::ble::BleError;
use crate::protocol::commands::{self, DONE_ACK, LOADED_ACK, MKDIR_ACK};
use crate::session::Session;

use library::{module_name, module_path, LIBRARY};

/// Length of the random module name used for oversized scripts.
const TEMP_NAME_LEN: usize = 4;

/// A random lowercase module name. Modules can only be loaded once per VM
/// lifetime, so every oversized script needs a fresh one.
fn temp_module_name() -> String {
    let mut rng = rand::thread_rng();
    (0..TEMP_NAME_LEN)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

impl Session {
    /// Run a script of any length.
    ///
    /// Scripts that fit in one frame are sent directly. Longer ones are
    /// written to a temporary module, loaded, and deleted again. With
    /// `await_result` the first print is returned.
    pub async fn run_script(
        &self,
        source: &str,
        await_result: bool,
    ) -> Result<Option<String>, BleError> {
        if source.len() <= self.max_text_payload() {
            return self.send_text(source, await_result, None).await;
        }

        let name = temp_module_name();
        let path = format!("/{}.lua", name);
        log::debug!(
            "Script is {} bytes (limit {}), running it from {}",
            source.len(),
            self.max_text_payload(),
            path
        );
        let result = self.run_from_file(&name, &path, source, await_result).await;

        match self.files().delete_file(&path).await {
            Ok(true) => {}
            Ok(false) => log::warn!("Device did not confirm removing {}", path),
            Err(e) => log::warn!("Couldn't remove {}: {}", path, e),
        }
        result
    }

    async fn run_from_file(
        &self,
        name: &str,
        path: &str,
        source: &str,
        await_result: bool,
    ) -> Result<Option<String>, BleError> {
        self.files().write_file(path, source.as_bytes(), true).await?;

        if await_result {
            return self
                .send_text(&commands::require(name, None), true, None)
                .await;
        }

        let response = self
            .send_text(&commands::require(name, Some(DONE_ACK)), true, None)
            .await?
            .unwrap_or_default();
        if response != DONE_ACK {
            return Err(BleError::UnexpectedResponse {
                expected: DONE_ACK.to_string(),
                received: response,
            });
        }
        Ok(None)
    }

    /// Make sure the global `name` is defined on the device, installing it
    /// from `source` (a module defining that global) when needed.
    ///
    /// Checks for the global first, then for an already uploaded module
    /// file, and only uploads the source when neither is usable.
    pub async fn inject_library_function(&self, name: &str, source: &str) -> Result<(), BleError> {
        let defined = self
            .send_text(&commands::is_defined(name), true, None)
            .await?;
        if defined.as_deref() == Some("true") {
            log::trace!("{} already defined", name);
            return Ok(());
        }

        let path = module_path(name);
        let load = commands::require(&module_name(name), Some(LOADED_ACK));
        if self.files().file_exists(&path).await? {
            let response = self.send_text(&load, true, None).await?;
            if response.as_deref() == Some(LOADED_ACK) {
                log::debug!("Loaded {} from {}", name, path);
                return Ok(());
            }
            log::debug!(
                "Loading {} failed ({:?}), uploading it again",
                path,
                response
            );
        }

        self.files()
            .write_file(&path, source.as_bytes(), true)
            .await?;
        let response = self
            .send_text(&load, true, None)
            .await?
            .unwrap_or_default();
        if response != LOADED_ACK {
            return Err(BleError::UnexpectedResponse {
                expected: LOADED_ACK.to_string(),
                received: response,
            });
        }
        log::debug!("Installed {}", name);
        Ok(())
    }

    /// Install every helper routine, in load order.
    pub async fn inject_all_library_functions(&self) -> Result<(), BleError> {
        let response = self.send_text(&commands::mkdir("lib"), true, None).await?;
        if response.as_deref() != Some(MKDIR_ACK) {
            // Usually just means the directory is already there.
            log::debug!("mkdir lib: {:?}", response);
        }
        for function in &LIBRARY {
            self.inject_library_function(function.name, function.source)
                .await?;
        }
        Ok(())
    }
}
