//! Item records and their wire images.
//!
//! An *image* is the byte serialization of one item, self-delimited by the
//! length fields in its fixed header. The same encoding is used for the
//! per-class append logs and for the snapshot file, so replay is a single
//! parser over either.
//!
//! ## Wire format (little-endian, explicit by design)
//!
//! ```text
//! offset  size  field
//!      0     1  kind      1 = linked image, 0 = tombstone
//!      1     4  flags     opaque client flags
//!      5     4  exptime   absolute seconds since epoch, 0 = never
//!      9     8  cas       compare-and-swap token
//!     17     1  nkey      key length, 1..=250
//!     18     4  nbytes    value length
//!     22  nkey  key bytes
//!  22+nkey nbytes value bytes
//! ```
//!
//! `ntotal = 22 + nkey + nbytes` and the mapping image -> length is bijective,
//! which is what lets replay walk a file as a contiguous stream.
//!
//! A tombstone is the full image of the removed item with `kind = 0`: it has
//! the same `ntotal` as the item's link records and therefore lands in the
//! same size class, the same log writer, and the same on-disk FIFO.

use std::sync::Arc;

use crate::types::{CacheError, MAX_KEY_LEN};

/// Fixed image header length in bytes.
pub const HEADER_LEN: usize = 22;

const KIND_TOMBSTONE: u8 = 0;
const KIND_LINKED: u8 = 1;

/// One stored value. The key lives in the shard map; cloning is cheap because
/// the value body is reference-counted.
#[derive(Debug, Clone)]
pub struct Item {
    /// Opaque client flags stored and returned verbatim.
    pub flags: u32,
    /// Absolute expiration in seconds since the epoch; 0 = never.
    pub exptime: u32,
    /// Unique token assigned on every store.
    pub cas: u64,
    /// Value body.
    pub value: Arc<[u8]>,
}

impl Item {
    /// True if the item is past `now` (seconds since epoch).
    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }

    /// Wire length of this item's image under `key`.
    pub fn ntotal(&self, key: &[u8]) -> usize {
        HEADER_LEN + key.len() + self.value.len()
    }
}

/// Borrowed view of one decoded image.
#[derive(Debug, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub linked: bool,
    pub flags: u32,
    pub exptime: u32,
    pub cas: u64,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl ImageRef<'_> {
    /// Materialize the image's item record.
    pub fn to_item(&self) -> Item {
        Item {
            flags: self.flags,
            exptime: self.exptime,
            cas: self.cas,
            value: Arc::from(self.value),
        }
    }
}

fn encode(kind: u8, key: &[u8], item: &Item) -> Box<[u8]> {
    debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LEN);
    let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + item.value.len());
    buf.push(kind);
    buf.extend_from_slice(&item.flags.to_le_bytes());
    buf.extend_from_slice(&item.exptime.to_le_bytes());
    buf.extend_from_slice(&item.cas.to_le_bytes());
    buf.push(key.len() as u8);
    buf.extend_from_slice(&(item.value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&item.value);
    buf.into_boxed_slice()
}

/// Encode the link image of `item` under `key`.
pub fn encode_linked(key: &[u8], item: &Item) -> Box<[u8]> {
    encode(KIND_LINKED, key, item)
}

/// Encode the tombstone for a removed item. Same bytes as the link image
/// apart from the kind byte, so size class and writer are preserved.
pub fn encode_tombstone(key: &[u8], item: &Item) -> Box<[u8]> {
    encode(KIND_TOMBSTONE, key, item)
}

/// Read the self-described total length of the image starting at `buf[0]`.
/// Returns `None` when fewer than [`HEADER_LEN`] bytes are available.
pub fn peek_ntotal(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let nkey = buf[17] as usize;
    let nbytes = u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]) as usize;
    Some(HEADER_LEN + nkey + nbytes)
}

/// Decode the image occupying exactly `buf`. The caller has already sliced
/// the buffer to `peek_ntotal` bytes.
pub fn decode(buf: &[u8]) -> Result<ImageRef<'_>, CacheError> {
    let ntotal = peek_ntotal(buf).ok_or_else(short_input)?;
    if buf.len() != ntotal {
        return Err(short_input());
    }
    let kind = buf[0];
    if kind != KIND_LINKED && kind != KIND_TOMBSTONE {
        return Err(CacheError::io(
            "item image",
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad kind {kind}")),
        ));
    }
    let nkey = buf[17] as usize;
    if nkey == 0 || nkey > MAX_KEY_LEN {
        return Err(CacheError::KeyTooLong { len: nkey });
    }
    let flags = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let exptime = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let cas = u64::from_le_bytes([
        buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16],
    ]);
    let key = &buf[HEADER_LEN..HEADER_LEN + nkey];
    let value = &buf[HEADER_LEN + nkey..];
    Ok(ImageRef { linked: kind == KIND_LINKED, flags, exptime, cas, key, value })
}

fn short_input() -> CacheError {
    CacheError::io(
        "item image",
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "image shorter than header"),
    )
}
