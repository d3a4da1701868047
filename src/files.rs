//! Remote file operations
//!
//! Files are written by opening them on the device and appending escaped
//! chunks with one script statement per frame. Chunk boundaries always
//! fall between escape units so each statement is a valid string literal
//! on its own.

use crate::ble::BleError;
use crate::protocol::commands::{
    self, CLOSE_ACK, DELETE_ACK, EXISTS_ACK, OPEN_ACK, WRITE_OVERHEAD,
};
use crate::protocol::escape::{escape_lua, safe_chunk_end, unit_count};
use crate::session::Session;

/// End of the next chunk of `escaped` starting at `start` whose write
/// command fits in `max_payload` bytes.
fn next_chunk_end(
    escaped: &str,
    start: usize,
    max_payload: usize,
    ack: Option<usize>,
) -> Result<usize, BleError> {
    let overhead = WRITE_OVERHEAD + ack.map_or(0, commands::write_ack_overhead);
    let end = safe_chunk_end(escaped, start, max_payload.saturating_sub(overhead));
    if end == start {
        return Err(BleError::MtuTooSmall);
    }
    Ok(end)
}

/// File operations on the device a [`Session`] is connected to.
pub struct RemoteFiles<'a> {
    session: &'a Session,
}

impl Session {
    pub fn files(&self) -> RemoteFiles<'_> {
        RemoteFiles { session: self }
    }
}

impl<'a> RemoteFiles<'a> {
    /// Write `data` to `path`, replacing any existing file.
    ///
    /// When `checked`, the open and every chunk are acknowledged by the
    /// device and a mismatch aborts the upload. The close is acknowledged
    /// either way.
    pub async fn write_file(&self, path: &str, data: &[u8], checked: bool) -> Result<(), BleError> {
        let escaped = escape_lua(data);

        let response = self
            .session
            .send_text(&commands::open_for_write(path, checked), checked, None)
            .await?;
        if let Some(response) = response {
            if response != OPEN_ACK {
                return Err(BleError::OpenFailed {
                    path: path.to_string(),
                    response,
                });
            }
        }

        let mut start = 0;
        let mut raw_start = 0;
        let mut index = 0;
        while start < escaped.len() {
            let ack = checked.then_some(index);
            let end = next_chunk_end(&escaped, start, self.session.max_text_payload(), ack)?;

            let chunk = &escaped[start..end];
            let raw_end = raw_start + unit_count(chunk);
            let response = self
                .session
                .send_text(&commands::write_chunk(chunk, ack), checked, None)
                .await?;
            if let Some(response) = response {
                if response != index.to_string() {
                    return Err(BleError::WriteMismatch {
                        start: raw_start,
                        end: raw_end,
                        response,
                    });
                }
            }

            log::trace!("Wrote bytes {}..{} of {}", raw_start, raw_end, path);
            start = end;
            raw_start = raw_end;
            index += 1;
        }

        let response = self
            .session
            .send_text(&commands::close(), true, None)
            .await?
            .unwrap_or_default();
        if response != CLOSE_ACK {
            return Err(BleError::CloseFailed(response));
        }
        log::debug!("Wrote {} bytes to {} in {} chunks", data.len(), path, index);
        Ok(())
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool, BleError> {
        let response = self
            .session
            .send_text(&commands::file_exists(path), true, None)
            .await?;
        Ok(response.as_deref() == Some(EXISTS_ACK))
    }

    /// Returns whether the device reported the file as removed.
    pub async fn delete_file(&self, path: &str) -> Result<bool, BleError> {
        let response = self
            .session
            .send_text(&commands::remove(path), true, None)
            .await?;
        Ok(response.as_deref() == Some(DELETE_ACK))
    }

    /// Read a whole file back over the data channel.
    ///
    /// Needs the file streaming helper installed on the device (see
    /// [`Session::inject_all_library_functions`]). The helper ends the
    /// stream with a newline after the last partial block; it is removed.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, BleError> {
        let pending = self.session.expect_data()?;
        self.session
            .send_text(&commands::stream_file(path), false, None)
            .await?;
        let mut content = pending.wait(self.session.response_timeout()).await?;
        if content.last() == Some(&b'\n') {
            content.pop();
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::max_text_payload;

    #[test]
    fn test_chunk_fits_write_command() {
        let escaped = escape_lua(b"abcdefgh");
        let max = WRITE_OVERHEAD + 5;
        let end = next_chunk_end(&escaped, 0, max, None).unwrap();
        assert_eq!(end, 5);
        assert_eq!(commands::write_chunk(&escaped[..end], None).len(), max);
        assert_eq!(next_chunk_end(&escaped, 5, max, None).unwrap(), 8);
    }

    #[test]
    fn test_mtu_too_small() {
        // Nothing is left for data once the checked write command and its
        // acknowledgement are counted.
        let escaped = escape_lua(b"abc");
        assert_eq!(
            next_chunk_end(&escaped, 0, max_text_payload(20), Some(0)),
            Err(BleError::MtuTooSmall)
        );

        // Room for three characters, but the first escape is four long.
        let escaped = escape_lua(b"\xffabc");
        assert_eq!(
            next_chunk_end(&escaped, 0, WRITE_OVERHEAD + 3, None),
            Err(BleError::MtuTooSmall)
        );
    }
}
