//! Recovery of pages that fail validation when read from disk.
//!
//! A page read while the server is writing it may be torn. It is re-read a
//! number of times and, if still invalid, fetched through the server, which
//! returns the copy from shared buffers.

use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::fs::walker::segment_number;
use crate::page::{self, absolute_block, PageState, BLOCK_SIZE};
use crate::server::{BlockFetchError, DatabaseServer};
use crate::utils::errors::{BackupError, Result};

/// A recovered block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Page(Bytes),
    /// The relation was truncated at or below this block.
    Truncated,
}

pub struct BlockFetcher {
    server: Arc<dyn DatabaseServer>,
    local_retries: u32,
    retry_delay: Duration,
    query_timeout: Duration,
    checksums_enabled: bool,
}

impl BlockFetcher {
    pub fn new(server: Arc<dyn DatabaseServer>, config: &FetchConfig, checksums_enabled: bool) -> Self {
        Self {
            server,
            local_retries: config.local_retries,
            retry_delay: config.retry_delay(),
            query_timeout: config.query_timeout(),
            checksums_enabled,
        }
    }

    pub fn checksums_enabled(&self) -> bool {
        self.checksums_enabled
    }

    /// Recover block `blkno` of the segment at `source` (`rel_path` relative
    /// to the data directory).
    pub async fn fetch_block(&self, source: &Path, rel_path: &str, blkno: u32) -> Result<Fetched> {
        let abs = absolute_block(segment_number(rel_path), blkno);

        for attempt in 1..=self.local_retries {
            tokio::time::sleep(self.retry_delay).await;
            match read_page_at(source, blkno).await {
                Ok(page) if page.is_empty() => {
                    debug!("File \"{}\" truncated at block {}", rel_path, blkno);
                    return Ok(Fetched::Truncated);
                }
                Ok(page) => {
                    if page::inspect(&page, abs, self.checksums_enabled).is_usable() {
                        debug!(
                            "Block {} of \"{}\" valid after {} re-reads",
                            blkno, rel_path, attempt
                        );
                        return Ok(Fetched::Page(Bytes::from(page)));
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) => return Err(BackupError::from_open(e, "file", source)),
            }
        }

        warn!(
            "Block {} of \"{}\" is still invalid after {} re-reads, fetching it through the server",
            blkno, rel_path, self.local_retries
        );
        self.query_block(source, rel_path, blkno, abs).await
    }

    async fn query_block(&self, source: &Path, rel_path: &str, blkno: u32, abs: u32) -> Result<Fetched> {
        let unavailable = |reason: String| BackupError::BlockUnavailable {
            path: rel_path.to_string(),
            block: blkno,
            reason,
        };

        let reply = tokio::time::timeout(self.query_timeout, self.server.fetch_block(rel_path, blkno))
            .await
            .map_err(|_| unavailable(format!("query timed out after {:?}", self.query_timeout)))?;

        match reply {
            Ok(bytes) => {
                if bytes.len() != BLOCK_SIZE {
                    return Err(unavailable(format!("server returned {} bytes", bytes.len())));
                }
                let mut page = bytes.to_vec();
                // Pages from shared buffers carry the checksum of their last write.
                if self.checksums_enabled && page.iter().any(|b| *b != 0) {
                    page::set_checksum(&mut page, abs);
                }
                match page::inspect(&page, abs, self.checksums_enabled) {
                    PageState::Invalid(defect) => Err(BackupError::PageCorrupt {
                        path: rel_path.to_string(),
                        block: blkno,
                        reason: defect.to_string(),
                    }),
                    _ => Ok(Fetched::Page(Bytes::from(page))),
                }
            }
            Err(BlockFetchError::PageCorrupt) => Err(BackupError::PageCorrupt {
                path: rel_path.to_string(),
                block: blkno,
                reason: "server reports the page as invalid".to_string(),
            }),
            Err(BlockFetchError::RelationGone) => match tokio::fs::try_exists(source).await {
                Ok(true) => Ok(Fetched::Truncated),
                _ => Err(BackupError::FileVanished(rel_path.to_string())),
            },
            Err(BlockFetchError::Failed(msg)) => Err(unavailable(msg)),
        }
    }
}

/// Read up to one page at block `blkno`. Returns fewer than `BLOCK_SIZE`
/// bytes at end of file.
pub async fn read_page_at(path: &Path, blkno: u32) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(blkno as u64 * BLOCK_SIZE as u64)).await?;
    read_page(&mut file).await
}

/// Read up to one page from the current position.
pub async fn read_page<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut page = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut page[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    page.truncate(filled);
    Ok(page)
}
