use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc64fast_nvme::Digest;

use crate::error::{SnapshotError, SnapshotResult};
use crate::fs::list_sorted_files;

/// One file of a snapshot packaged for over-the-wire transfer.
///
/// A chunk is self-describing: `checksum` covers `content`, and
/// `snapshot_checksum` is the combined checksum of the whole snapshot the
/// chunk belongs to, identical across all of its chunks. Any recipient can
/// validate a chunk without further context.
///
/// Wire format, big-endian, fixed field order:
/// `snapshot_id` (u16 len + bytes), `total_count: u32`, `chunk_name`
/// (u16 len + bytes), `checksum: u64`, `snapshot_checksum: u64`,
/// `content` (u32 len + bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    snapshot_id: String,
    total_count: u32,
    chunk_name: String,
    checksum: u64,
    snapshot_checksum: u64,
    content: Vec<u8>,
}

impl SnapshotChunk {
    /// Builds a chunk for transfer, computing the content checksum.
    pub fn new(
        snapshot_id: impl Into<String>,
        total_count: u32,
        chunk_name: impl Into<String>,
        snapshot_checksum: u64,
        content: Vec<u8>,
    ) -> Self {
        let checksum = crc64(&content);
        Self {
            snapshot_id: snapshot_id.into(),
            total_count,
            chunk_name: chunk_name.into(),
            checksum,
            snapshot_checksum,
            content,
        }
    }

    /// Builds a chunk with every field given verbatim, including a checksum
    /// that need not match the content. Decoded chunks come through here.
    pub fn from_parts(
        snapshot_id: impl Into<String>,
        total_count: u32,
        chunk_name: impl Into<String>,
        checksum: u64,
        snapshot_checksum: u64,
        content: Vec<u8>,
    ) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            total_count,
            chunk_name: chunk_name.into(),
            checksum,
            snapshot_checksum,
            content,
        }
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    pub fn chunk_name(&self) -> &str {
        &self.chunk_name
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn snapshot_checksum(&self) -> u64 {
        self.snapshot_checksum
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn encode(&self) -> SnapshotResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(
            2 + self.snapshot_id.len() + 4 + 2 + self.chunk_name.len() + 8 + 8 + 4
                + self.content.len(),
        );
        write_short_str(&mut buf, &self.snapshot_id, "snapshot id")?;
        buf.write_u32::<BigEndian>(self.total_count)?;
        write_short_str(&mut buf, &self.chunk_name, "chunk name")?;
        buf.write_u64::<BigEndian>(self.checksum)?;
        buf.write_u64::<BigEndian>(self.snapshot_checksum)?;
        if self.content.len() > u32::MAX as usize {
            return Err(SnapshotError::decode(format!(
                "chunk content too large: {} bytes",
                self.content.len()
            )));
        }
        buf.write_u32::<BigEndian>(self.content.len() as u32)?;
        buf.extend_from_slice(&self.content);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> SnapshotResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let snapshot_id = read_short_str(&mut cursor, "snapshot id")?;
        let total_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| truncated("total count"))?;
        let chunk_name = read_short_str(&mut cursor, "chunk name")?;
        let checksum = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| truncated("chunk checksum"))?;
        let snapshot_checksum = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| truncated("snapshot checksum"))?;
        let content_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| truncated("content length"))? as usize;
        let mut content = vec![0u8; content_len];
        cursor
            .read_exact(&mut content)
            .map_err(|_| truncated("content"))?;
        if cursor.position() as usize != bytes.len() {
            return Err(SnapshotError::decode("trailing bytes after chunk record"));
        }
        Ok(Self {
            snapshot_id,
            total_count,
            chunk_name,
            checksum,
            snapshot_checksum,
            content,
        })
    }
}

/// Checksum of a byte sequence. Deterministic and stable across hosts.
pub fn crc64(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut digest = Digest::new();
    digest.write(bytes);
    digest.sum64()
}

/// Combined checksum of an ordered sequence of file contents.
///
/// Folds the per-file checksum of each element, in the order given, into an
/// outer digest. Callers are responsible for passing files in ascending
/// file-name order; the fold is deliberately order-sensitive.
pub fn combined_checksum<'a, I>(parts: I) -> u64
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut outer = Digest::new();
    for part in parts {
        outer.write(&crc64(part).to_be_bytes());
    }
    outer.sum64()
}

/// Combined checksum of all files in a directory, ascending by file name.
pub fn combined_checksum_of_dir(dir: &Path) -> SnapshotResult<u64> {
    let mut outer = Digest::new();
    for (_, path) in list_sorted_files(dir)? {
        let content = std::fs::read(&path)?;
        outer.write(&crc64(&content).to_be_bytes());
    }
    Ok(outer.sum64())
}

fn write_short_str(buf: &mut Vec<u8>, value: &str, field: &str) -> SnapshotResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(SnapshotError::decode(format!(
            "{field} too long: {} bytes",
            bytes.len()
        )));
    }
    buf.write_u16::<BigEndian>(bytes.len() as u16)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_short_str(cursor: &mut Cursor<&[u8]>, field: &str) -> SnapshotResult<String> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| truncated(field))? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(|_| truncated(field))?;
    String::from_utf8(bytes)
        .map_err(|_| SnapshotError::decode(format!("{field} is not valid UTF-8")))
}

fn truncated(field: &str) -> SnapshotError {
    SnapshotError::decode(format!("record truncated reading {field}"))
}
