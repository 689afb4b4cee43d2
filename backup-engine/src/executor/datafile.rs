//! Block-level copy of relation segments and the stored data file format.
//!
//! A stored data file is a sequence of blocks, each preceded by an 8 byte
//! header `[block u32 LE][size i32 LE]`:
//!
//! - `size == BLOCK_SIZE`: raw page follows
//! - `0 < size < BLOCK_SIZE`: zstd-compressed page follows
//! - `size == -2`: the relation was truncated at `block`; no payload
//!
//! Block numbers are strictly increasing within a file.

use std::collections::BTreeSet;
use std::io::{self, ErrorKind, SeekFrom};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{inherited_entry, FileCopier, PartialFile};
use crate::catalog::manifest::to_ranges;
use crate::catalog::{FileKind, ManifestEntry};
use crate::config::Compression;
use crate::fetch::{read_page, Fetched};
use crate::page::{self, absolute_block, PageState, BLOCK_SIZE};
use crate::strategy::{BlockSelection, PlannedFile};
use crate::utils::errors::{BackupError, Result};

pub const BLOCK_HEADER_SIZE: usize = 8;
const TRUNCATED_MARKER: i32 = -2;

/// Encode one page with its header.
pub fn encode_block(blkno: u32, page: &[u8], compression: Compression, level: i32) -> Vec<u8> {
    let compressed = match compression {
        Compression::Zstd => zstd::bulk::compress(page, level)
            .ok()
            .filter(|c| !c.is_empty() && c.len() < BLOCK_SIZE),
        Compression::None => None,
    };
    let payload: &[u8] = compressed.as_deref().unwrap_or(page);

    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    out.extend_from_slice(&blkno.to_le_bytes());
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_truncation(blkno: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE);
    out.extend_from_slice(&blkno.to_le_bytes());
    out.extend_from_slice(&TRUNCATED_MARKER.to_le_bytes());
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredContent {
    Page(Vec<u8>),
    /// Relation ends before this block
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub blkno: u32,
    pub content: StoredContent,
}

/// Decodes a stored data file, hashing every byte it consumes.
pub struct StoredBlockReader<R> {
    reader: R,
    hasher: crc32fast::Hasher,
    bytes: u64,
    last_block: Option<u32>,
}

impl<R: AsyncRead + Unpin> StoredBlockReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: crc32fast::Hasher::new(),
            bytes: 0,
            last_block: None,
        }
    }

    /// Next block, or `None` at a clean end of file.
    ///
    /// Malformed input is reported as `ErrorKind::InvalidData`.
    pub async fn next_block(&mut self) -> io::Result<Option<StoredBlock>> {
        let mut header = [0u8; BLOCK_HEADER_SIZE];
        let mut filled = 0;
        while filled < BLOCK_HEADER_SIZE {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => return Ok(None),
            BLOCK_HEADER_SIZE => {}
            n => return Err(invalid(format!("block header cut short after {} bytes", n))),
        }
        self.consume(&header);

        let blkno = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if let Some(last) = self.last_block {
            if blkno <= last {
                return Err(invalid(format!("block {} stored after block {}", blkno, last)));
            }
        }
        self.last_block = Some(blkno);

        let content = if size == TRUNCATED_MARKER {
            StoredContent::Truncated
        } else if size > 0 && size as usize <= BLOCK_SIZE {
            let mut payload = vec![0u8; size as usize];
            self.reader.read_exact(&mut payload).await.map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    invalid(format!("payload of block {} cut short", blkno))
                } else {
                    e
                }
            })?;
            self.consume(&payload);
            if payload.len() == BLOCK_SIZE {
                StoredContent::Page(payload)
            } else {
                let page = zstd::bulk::decompress(&payload, BLOCK_SIZE)
                    .map_err(|e| invalid(format!("block {} does not decompress: {}", blkno, e)))?;
                if page.len() != BLOCK_SIZE {
                    return Err(invalid(format!(
                        "block {} decompressed to {} bytes",
                        blkno,
                        page.len()
                    )));
                }
                StoredContent::Page(page)
            }
        } else {
            return Err(invalid(format!("block {} has invalid size {}", blkno, size)));
        };

        Ok(Some(StoredBlock { blkno, content }))
    }

    /// CRC-32 and length of everything read so far.
    pub fn finish(self) -> (u32, u64) {
        (self.hasher.finalize(), self.bytes)
    }

    fn consume(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Hashing writer for stored files.
pub(super) struct StoredWriter<W> {
    inner: W,
    hasher: crc32fast::Hasher,
    bytes: u64,
}

impl<W: AsyncWrite + Unpin> StoredWriter<W> {
    pub(super) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            bytes: 0,
        }
    }

    pub(super) async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        Ok(())
    }

    pub(super) fn into_parts(self) -> (W, u32, u64) {
        (self.inner, self.hasher.finalize(), self.bytes)
    }
}

enum Blocks<'a> {
    Sequential(std::ops::Range<u32>),
    Listed(std::collections::btree_set::Iter<'a, u32>, u32),
}

impl Iterator for Blocks<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self {
            Blocks::Sequential(range) => range.next(),
            // Blocks past the listed length are replayed from WAL.
            Blocks::Listed(iter, n_blocks) => iter.next().copied().filter(|b| *b < *n_blocks),
        }
    }
}

fn blocks_to_visit(selection: &BlockSelection, n_blocks: u32) -> Blocks<'_> {
    match selection {
        BlockSelection::Listed(set) => Blocks::Listed(set.iter(), n_blocks),
        BlockSelection::All | BlockSelection::LsnAbove(_) => Blocks::Sequential(0..n_blocks),
    }
}

fn wanted(selection: &BlockSelection, state: &PageState) -> bool {
    match (selection, state) {
        (BlockSelection::LsnAbove(watermark), PageState::Valid { lsn }) => {
            !lsn.is_valid() || lsn >= watermark
        }
        _ => true,
    }
}

/// Copy the selected blocks of one relation segment.
pub(super) async fn copy_data_file(
    ctx: &FileCopier,
    planned: &PlannedFile,
    selection: &BlockSelection,
) -> Result<ManifestEntry> {
    let file = &planned.file;
    let rel = file.relative_path.as_str();
    let n_blocks = file.size.div_ceil(BLOCK_SIZE as u64) as u32;
    let segno = file.segment_number();

    let mut source = tokio::fs::File::open(&file.path)
        .await
        .map_err(|e| BackupError::from_open(e, "file", &file.path))?;

    let dest = ctx.destination.join(rel);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let guard = PartialFile::new(dest.clone());
    let out = tokio::fs::File::create(&dest).await?;
    let mut writer = StoredWriter::new(BufWriter::new(out));

    let mut copied: Vec<u32> = Vec::new();
    let mut truncated_at: Option<u32> = None;

    for blkno in blocks_to_visit(selection, n_blocks) {
        if ctx.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        source.seek(SeekFrom::Start(blkno as u64 * BLOCK_SIZE as u64)).await?;
        let page = read_page(&mut source).await?;
        if page.is_empty() {
            truncated_at = Some(blkno);
            break;
        }
        ctx.progress.add_bytes(page.len() as u64);

        let abs = absolute_block(segno, blkno);
        let mut state = page::inspect(&page, abs, ctx.fetcher.checksums_enabled());
        let page = if state.is_usable() {
            page
        } else {
            debug!("Block {} of \"{}\" failed validation: {:?}", blkno, rel, state);
            match ctx.fetcher.fetch_block(&file.path, rel, blkno).await? {
                Fetched::Page(bytes) => {
                    state = page::inspect(&bytes, abs, ctx.fetcher.checksums_enabled());
                    bytes.to_vec()
                }
                Fetched::Truncated => {
                    truncated_at = Some(blkno);
                    break;
                }
            }
        };

        if !wanted(selection, &state) {
            continue;
        }
        writer
            .write(&encode_block(blkno, &page, ctx.compression, ctx.compression_level))
            .await?;
        copied.push(blkno);
    }

    if let Some(blkno) = truncated_at {
        debug!("File \"{}\" truncated concurrently at block {}", rel, blkno);
        writer.write(&encode_truncation(blkno)).await?;
    }

    let (mut out, checksum, stored) = writer.into_parts();
    out.flush().await?;
    out.into_inner().sync_all().await?;

    let parent_entry = planned
        .parent_entry
        .as_ref()
        .filter(|p| p.kind == FileKind::DataFile);

    if let (Some(prev), Some(parent_id)) = (parent_entry, ctx.parent_id) {
        if copied.is_empty() && truncated_at.is_none() {
            // Nothing changed: drop the empty copy.
            drop(guard);
            return Ok(inherited_entry(file, prev, parent_id));
        }
    }
    guard.keep();

    Ok(ManifestEntry {
        path: file.relative_path.clone(),
        kind: FileKind::DataFile,
        size: file.size,
        mode: file.mode,
        mtime: file.mtime,
        stored_bytes: Some(stored),
        checksum,
        n_blocks: Some(truncated_at.unwrap_or(n_blocks)),
        copied_blocks: to_ranges(&copied),
        truncated_at,
        inherited_from: parent_entry.and(ctx.parent_id),
    })
}

/// Block numbers stored in an entry.
pub fn stored_blocks(entry: &ManifestEntry) -> BTreeSet<u32> {
    entry
        .copied_blocks
        .iter()
        .flat_map(|r| r.start..r.end)
        .collect()
}
