//! Stack core (C5): the layer dispatch trait, the prototype→instance open
//! protocol, and the layer-agnostic helpers every concrete layer shares.
//!
//! Layer kinds are a closed set (Raw, Buffered, Aead, Lz4), so rather than a
//! deep inheritance hierarchy we dispatch through one object-safe trait,
//! [`Layer`], and chain instances as `Box<dyn Layer>` instead of a C-style
//! function-pointer table.

use std::path::Path;

use tracing::warn;

use crate::{
    error::{StackError, StackResult},
    host::RawOpenOptions,
};

/// Maximum payload size for [`write_sized`]/[`read_sized`] records.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Common per-instance state every concrete layer embeds by composition.
#[derive(Debug, Default)]
pub struct LayerState {
    eof: bool,
    error: Option<StackError>,
}

impl LayerState {
    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn set_eof(&mut self, eof: bool) {
        self.eof = eof;
    }

    pub fn last_error(&self) -> Option<&StackError> {
        self.error.as_ref()
    }

    /// Records `err` as this layer's sticky error, unless one is already
    /// set — the first error in a cascade survives, not the last.
    pub fn record_first_error(&mut self, err: StackError) {
        if self.error.is_none() {
            self.error = Some(err);
        } else {
            warn!(%err, "suppressing cascading error behind earlier sticky error");
        }
    }

    pub fn clear(&mut self) {
        self.eof = false;
        self.error = None;
    }
}

/// Single-layer dispatch surface. Every concrete layer (raw, buffered,
/// AEAD, LZ4) implements this; the facade and the helpers below only ever
/// see `&mut dyn Layer`.
pub trait Layer: Send {
    /// Single-layer read; may return short. `Ok(0)` signals EOF, not an
    /// error — check [`Layer::eof`] to tell it apart from "asked for zero
    /// bytes".
    fn read(&mut self, buf: &mut [u8], offset: u64) -> StackResult<usize>;

    /// Single-layer write; may be short.
    fn write(&mut self, buf: &[u8], offset: u64) -> StackResult<usize>;

    /// Durability barrier.
    fn sync(&mut self) -> StackResult<()>;

    /// Plaintext/logical file size.
    fn size(&mut self) -> StackResult<u64>;

    /// Truncate (shrink) or extend-with-zeros (grow) to `new_size`.
    fn resize(&mut self, new_size: u64) -> StackResult<()>;

    /// Flush, close the successor, free owned buffers. Preserves the first
    /// error seen. Called at most once; the instance is dropped afterward.
    fn close(&mut self) -> StackResult<()>;

    /// The block size this layer exposes upward; 1 means byte-granular.
    fn block_size(&self) -> u32;

    fn eof(&self) -> bool;

    fn last_error(&self) -> Option<&StackError>;

    fn clear_error(&mut self);
}

/// A configured-but-unopened layer, used as a template for per-file
/// [`LayerPrototype::open`]. Prototypes are built once at startup and
/// never freed.
pub trait LayerPrototype: Send + Sync {
    /// Clone `self`, open the successor prototype, and return a ready
    /// instance. On failure the instance itself is *not* returned — unlike
    /// a mid-stack layer, a prototype has nothing to hand back yet, so
    /// failure here is reported directly; layers further up the chain are
    /// responsible for rolling it into an error-carrying instance instead.
    fn open(&self, path: &Path, opts: RawOpenOptions) -> StackResult<Box<dyn Layer>>;

    /// The block size this prototype's instances will expose once opened.
    fn block_size(&self) -> u32;
}

/// Loops partial reads until `buf` is full, EOF, or an error. Returns the
/// total bytes read; a short return below `buf.len()` means EOF was hit.
pub fn read_all(layer: &mut dyn Layer, buf: &mut [u8], offset: u64) -> StackResult<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = layer.read(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Loops partial writes until `buf` is fully written or an error.
pub fn write_all(layer: &mut dyn Layer, buf: &[u8], offset: u64) -> StackResult<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = layer.write(&buf[total..], offset + total as u64)?;
        if n == 0 {
            return Err(StackError::logic(
                "write_all made no progress before reaching the requested size",
            ));
        }
        total += n;
    }
    Ok(total)
}

/// Writes a 4-byte big-endian length prefix followed by `payload`. Returns
/// the offset immediately past the record.
pub fn write_sized(layer: &mut dyn Layer, offset: u64, payload: &[u8]) -> StackResult<u64> {
    if payload.len() > MAX_RECORD_SIZE {
        return Err(StackError::RecordTooLarge {
            limit: MAX_RECORD_SIZE,
            actual: payload.len(),
        });
    }
    let len = payload.len() as u32;
    write_all(layer, &len.to_be_bytes(), offset)?;
    write_all(layer, payload, offset + 4)?;
    Ok(offset + 4 + payload.len() as u64)
}

/// Reads a length-prefixed record written by [`write_sized`]. Returns the
/// payload and the offset immediately past the record.
pub fn read_sized(layer: &mut dyn Layer, offset: u64) -> StackResult<(Vec<u8>, u64)> {
    let mut len_buf = [0u8; 4];
    let n = read_all(layer, &mut len_buf, offset)?;
    if n < 4 {
        return Err(StackError::logic(format!(
            "short length prefix: got {n} of 4 bytes at offset {offset}"
        )));
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(StackError::RecordTooLarge {
            limit: MAX_RECORD_SIZE,
            actual: len,
        });
    }
    let mut payload = vec![0u8; len];
    let got = read_all(layer, &mut payload, offset + 4)?;
    if got != len {
        return Err(StackError::corruption(format!(
            "short record payload: got {got} of {len} bytes at offset {}",
            offset + 4
        )));
    }
    Ok((payload, offset + 4 + len as u64))
}

pub fn read_u32(layer: &mut dyn Layer, offset: u64) -> StackResult<u32> {
    let mut buf = [0u8; 4];
    let n = read_all(layer, &mut buf, offset)?;
    if n != 4 {
        return Err(StackError::corruption(format!(
            "short read for u32 at offset {offset}: got {n} of 4 bytes"
        )));
    }
    Ok(u32::from_be_bytes(buf))
}

pub fn write_u32(layer: &mut dyn Layer, offset: u64, value: u32) -> StackResult<()> {
    write_all(layer, &value.to_be_bytes(), offset)?;
    Ok(())
}

pub fn read_u64(layer: &mut dyn Layer, offset: u64) -> StackResult<u64> {
    let mut buf = [0u8; 8];
    let n = read_all(layer, &mut buf, offset)?;
    if n != 8 {
        return Err(StackError::corruption(format!(
            "short read for u64 at offset {offset}: got {n} of 8 bytes"
        )));
    }
    Ok(u64::from_be_bytes(buf))
}

pub fn write_u64(layer: &mut dyn Layer, offset: u64, value: u64) -> StackResult<()> {
    write_all(layer, &value.to_be_bytes(), offset)?;
    Ok(())
}

/// Block-size-aware bulk copy between two layers, chunked so the buffer
/// stays a multiple of both layers' block sizes. Returns the number of
/// bytes actually copied (short if `src` hit EOF first).
pub fn copy_slice(
    src: &mut dyn Layer,
    src_off: u64,
    n: u64,
    dst: &mut dyn Layer,
    dst_off: u64,
) -> StackResult<u64> {
    let align = src.block_size().max(dst.block_size()).max(1) as u64;
    let chunk = ((256 * 1024 / align).max(1)) * align;
    let mut buf = vec![0u8; chunk as usize];
    let mut copied = 0u64;
    while copied < n {
        let want = (n - copied).min(chunk) as usize;
        let got = read_all(src, &mut buf[..want], src_off + copied)?;
        if got == 0 {
            break;
        }
        write_all(dst, &buf[..got], dst_off + copied)?;
        copied += got as u64;
        if got < want {
            break;
        }
    }
    Ok(copied)
}

pub(crate) fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}
