//! Directory listing, chunked file download and storage format.

use std::fmt;

use dvb_core::gatt;
use dvb_transport::GattTransport;
use tracing::{debug, error, info, warn};

use crate::error::DeviceError;
use crate::session::{DeviceSession, LinkState};

/// One `name;length` record from the directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Decimal size as reported by the unit.
    pub length: String,
}

impl FileEntry {
    /// Parses one listing record. Bytes map one-to-one onto chars; a record
    /// without a separator yields an empty length.
    pub fn parse(record: &[u8]) -> Self {
        let text: String = record.iter().map(|&b| char::from(b)).collect();
        let mut parts = text.split(';');
        let name = parts.next().unwrap_or_default().to_string();
        let length = parts.next().unwrap_or_default().to_string();
        Self { name, length }
    }

    pub fn size(&self) -> Option<u64> {
        self.length.trim().parse().ok()
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.name, self.length)
    }
}

/// Accumulates a download and tracks the request offset.
#[derive(Debug)]
struct DownloadCursor {
    chunk: usize,
    offset: usize,
    total: Option<u64>,
    data: Vec<u8>,
}

impl DownloadCursor {
    fn new(chunk: usize, total: Option<u64>) -> Self {
        Self {
            chunk: chunk.max(1),
            offset: 0,
            total,
            data: Vec::new(),
        }
    }

    /// A request goes out whenever the collected length sits on a chunk
    /// boundary, including before the first read.
    fn needs_request(&self) -> bool {
        self.data.len() % self.chunk == 0
    }

    fn request(&self, name: &str) -> Vec<u8> {
        format!("{name};{};", self.offset).into_bytes()
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() >= self.offset + self.chunk {
            self.offset += self.chunk;
            info!(offset = self.offset, "download offset advanced");
        }
    }

    fn progress(&self) -> Option<u8> {
        let total = self.total.filter(|total| *total > 0)?;
        let pct = (self.data.len() as f64 / total as f64 * 100.0).round();
        Some(pct.min(100.0) as u8)
    }
}

impl<T: GattTransport> DeviceSession<T> {
    /// Rebuilds the file catalog by reading the listing characteristic until
    /// it returns an empty value.
    ///
    /// Failures are logged, not returned: the catalog keeps whatever was read
    /// before the error. Callers inspect the returned snapshot.
    pub async fn list_files(&self) -> Vec<FileEntry> {
        let epoch = {
            let mut state = self.inner.state();
            if state.link != LinkState::Connected {
                error!("device is not connected, cannot list files");
                return Vec::new();
            }
            state.catalog.clear();
            state.epoch
        };
        loop {
            let record = match self.inner.read_characteristic(gatt::LIST_FILES).await {
                Ok(record) => record,
                Err(err) => {
                    error!(error = %err, "listing files failed");
                    break;
                }
            };
            if record.is_empty() {
                break;
            }
            let entry = FileEntry::parse(&record);
            debug!(name = %entry.name, length = %entry.length, "listed file");
            let mut state = self.inner.state();
            if state.epoch != epoch {
                debug!("listing superseded by disconnect");
                break;
            }
            state.catalog.push(entry);
        }
        self.file_list()
    }

    /// Last catalog read by [`list_files`](Self::list_files).
    pub fn file_list(&self) -> Vec<FileEntry> {
        self.inner.state().catalog.clone()
    }

    /// Downloads `name`, reporting percentages when the catalog knows its
    /// size.
    ///
    /// Failed steps are retried after the configured delay with no upper
    /// bound. A disconnect or teardown ends the loop with
    /// [`DeviceError::Cancelled`].
    pub async fn download_file(
        &self,
        name: &str,
        mut on_progress: impl FnMut(u8) + Send,
    ) -> Result<Vec<u8>, DeviceError> {
        let (epoch, total) = {
            let state = self.inner.state();
            if state.link != LinkState::Connected {
                return Err(DeviceError::NotConnected);
            }
            let total = state
                .catalog
                .iter()
                .find(|entry| entry.name == name)
                .and_then(FileEntry::size);
            (state.epoch, total)
        };
        let config = &self.inner.config;
        let mut cursor = DownloadCursor::new(config.download_chunk_size, total);
        info!(name, total = ?total, "download started");

        loop {
            if self.inner.current_epoch() != epoch {
                return Err(DeviceError::Cancelled);
            }
            match self.download_step(name, &mut cursor).await {
                Ok(true) => {
                    if let Some(pct) = cursor.progress() {
                        on_progress(pct);
                    }
                }
                Ok(false) => break,
                Err(err) => {
                    warn!(offset = cursor.offset, error = %err, "download step failed, retrying");
                    if !self
                        .inner
                        .sleep_unless_cancelled(epoch, config.download_retry_delay)
                        .await
                    {
                        return Err(DeviceError::Cancelled);
                    }
                }
            }
        }
        info!(name, bytes = cursor.data.len(), "download finished");
        Ok(cursor.data)
    }

    /// Writes the request when due and reads one response. Returns `false`
    /// on the empty read that ends the file.
    async fn download_step(
        &self,
        name: &str,
        cursor: &mut DownloadCursor,
    ) -> Result<bool, DeviceError> {
        if cursor.needs_request() {
            self.inner
                .write_auxiliary(gatt::FILE_REQUEST, &cursor.request(name))
                .await?;
        }
        let bytes = self.inner.read_characteristic(gatt::FILE_RESPONSE).await?;
        if bytes.is_empty() {
            return Ok(false);
        }
        cursor.absorb(&bytes);
        Ok(true)
    }

    /// Triggers a storage format on the unit. The read value is ignored.
    pub async fn format_storage(&self) -> Result<(), DeviceError> {
        self.inner.read_characteristic(gatt::FORMAT_STORAGE).await?;
        info!("storage formatted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_record_splits_on_semicolon() {
        let entry = FileEntry::parse(b"firmware.bin;4096");
        assert_eq!(entry.name, "firmware.bin");
        assert_eq!(entry.length, "4096");
        assert_eq!(entry.size(), Some(4096));
        assert_eq!(entry.to_string(), "firmware.bin;4096");
    }

    #[test]
    fn record_without_separator_has_no_size() {
        let entry = FileEntry::parse(b"orphan");
        assert_eq!(entry.name, "orphan");
        assert_eq!(entry.length, "");
        assert_eq!(entry.size(), None);
    }

    #[test]
    fn high_bytes_map_to_latin1_chars() {
        let entry = FileEntry::parse(&[b'a', 0xe9, b';', b'1']);
        assert_eq!(entry.name, "a\u{e9}");
    }

    #[test]
    fn requests_are_due_on_chunk_boundaries() {
        let mut cursor = DownloadCursor::new(4, Some(10));
        assert!(cursor.needs_request());
        assert_eq!(cursor.request("log.dvb"), b"log.dvb;0;".to_vec());

        cursor.absorb(&[0; 3]);
        assert!(!cursor.needs_request());
        cursor.absorb(&[0; 1]);
        assert!(cursor.needs_request());
        assert_eq!(cursor.request("log.dvb"), b"log.dvb;4;".to_vec());
        assert_eq!(cursor.progress(), Some(40));
    }

    #[test]
    fn offset_advances_once_per_absorb() {
        let mut cursor = DownloadCursor::new(4, None);
        cursor.absorb(&[0; 9]);
        assert_eq!(cursor.offset, 4);
        cursor.absorb(&[0; 1]);
        assert_eq!(cursor.offset, 8);
    }

    #[test]
    fn progress_needs_known_size_and_caps_at_100() {
        let mut unknown = DownloadCursor::new(4, None);
        unknown.absorb(&[0; 2]);
        assert_eq!(unknown.progress(), None);

        let mut zero = DownloadCursor::new(4, Some(0));
        zero.absorb(&[0; 2]);
        assert_eq!(zero.progress(), None);

        let mut over = DownloadCursor::new(4, Some(3));
        over.absorb(&[0; 5]);
        assert_eq!(over.progress(), Some(100));
    }

    #[test]
    fn progress_rounds_to_nearest() {
        let mut cursor = DownloadCursor::new(1024, Some(3));
        cursor.absorb(&[0; 2]);
        assert_eq!(cursor.progress(), Some(67));
    }
}
