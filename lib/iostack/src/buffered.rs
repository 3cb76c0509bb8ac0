//! Buffered layer (C4): presents a byte-granular stream view over a
//! successor that may require block-aligned I/O. Maintains a single
//! aligned one-block read-modify-write cache.

use std::path::Path;

use tracing::instrument;

use crate::{
    error::{StackError, StackResult},
    host::RawOpenOptions,
    layer::{self, Layer, LayerPrototype, LayerState},
};

fn round_down(offset: u64, block_size: u64) -> u64 {
    offset - (offset % block_size)
}

fn round_up_to_multiple(value: u32, multiple: u32) -> u32 {
    layer::div_round_up(value as u64, multiple as u64) as u32 * multiple
}

/// Configuration for a [`BufferedPrototype`].
#[derive(Clone, Copy, Debug)]
pub struct BufferedConfig {
    /// Requested buffer block size; rounded up to a multiple of the
    /// successor's block size if that successor isn't byte-granular.
    pub block_size: u32,
}

impl Default for BufferedConfig {
    fn default() -> Self {
        Self {
            block_size: 8 * 1024,
        }
    }
}

pub struct BufferedPrototype {
    inner: Box<dyn LayerPrototype>,
    config: BufferedConfig,
}

impl BufferedPrototype {
    pub fn new(inner: Box<dyn LayerPrototype>, config: BufferedConfig) -> Self {
        Self { inner, config }
    }
}

impl LayerPrototype for BufferedPrototype {
    fn open(&self, path: &Path, opts: RawOpenOptions) -> StackResult<Box<dyn Layer>> {
        // Write-only upstream is promoted to read/write downstream: the
        // read-modify-write pattern needs to be able to read back a block
        // before patching it.
        let mut successor_opts = opts;
        if successor_opts.write {
            successor_opts.read = true;
        }

        let next = self.inner.open(path, successor_opts)?;
        let successor_block_size = next.block_size().max(1);
        let block_size = round_up_to_multiple(self.config.block_size.max(1), successor_block_size);

        Ok(Box::new(BufferedLayer {
            next,
            block_size,
            buf: vec![0u8; block_size as usize],
            current_block: None,
            current_size: 0,
            dirty: false,
            file_size: 0,
            size_confirmed: false,
            state: LayerState::default(),
        }))
    }

    fn block_size(&self) -> u32 {
        1
    }
}

pub struct BufferedLayer {
    next: Box<dyn Layer>,
    block_size: u32,
    buf: Vec<u8>,
    current_block: Option<u64>,
    current_size: u32,
    dirty: bool,
    file_size: u64,
    size_confirmed: bool,
    state: LayerState,
}

impl BufferedLayer {
    fn position_to_buffer(&mut self, offset: u64) -> StackResult<()> {
        let block_start = round_down(offset, self.block_size as u64);
        if self.current_block != Some(block_start) {
            self.flush()?;
            self.current_block = Some(block_start);
            self.current_size = 0;
        }
        Ok(())
    }

    /// Loads the current block from the successor if it hasn't been read
    /// into the cache yet this position.
    fn ensure_loaded(&mut self) -> StackResult<()> {
        if self.dirty || self.current_size > 0 {
            return Ok(());
        }
        let block_start = self.current_block.expect("position_to_buffer called first");
        let n = layer::read_all(self.next.as_mut(), &mut self.buf, block_start)?;
        self.current_size = n as u32;
        Ok(())
    }

    fn flush(&mut self) -> StackResult<()> {
        if self.dirty {
            let block_start = self.current_block.expect("dirty buffer must be positioned");
            layer::write_all(
                self.next.as_mut(),
                &self.buf[..self.current_size as usize],
                block_start,
            )?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl Layer for BufferedLayer {
    #[instrument(skip_all, level = "trace")]
    fn read(&mut self, buf: &mut [u8], offset: u64) -> StackResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let block_start = round_down(offset, self.block_size as u64);
        let in_block_off = (offset - block_start) as u32;

        // Direct-read fast path: a block-aligned request for at least one
        // full block, that doesn't land on the block currently cached
        // (avoids serving stale data out from under a dirty cache).
        if in_block_off == 0
            && buf.len() >= self.block_size as usize
            && self.current_block != Some(block_start)
        {
            let full_blocks = buf.len() / self.block_size as usize;
            let direct_len = full_blocks * self.block_size as usize;
            let n = layer::read_all(self.next.as_mut(), &mut buf[..direct_len], offset)?;
            self.state.set_eof(n < direct_len);
            if n < direct_len {
                return Ok(n);
            }
            let rest = self.read(&mut buf[direct_len..], offset + direct_len as u64)?;
            return Ok(direct_len + rest);
        }

        self.position_to_buffer(offset)?;
        self.ensure_loaded()?;

        if in_block_off >= self.current_size {
            self.state.set_eof(true);
            return Ok(0);
        }

        let available = (self.current_size - in_block_off) as usize;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.buf[in_block_off as usize..in_block_off as usize + n]);
        self.state.set_eof(false);
        Ok(n)
    }

    #[instrument(skip_all, level = "trace")]
    fn write(&mut self, buf: &[u8], offset: u64) -> StackResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let current_size = self.size()?;
        if offset > current_size {
            return Err(StackError::logic(format!(
                "write at offset {offset} would create a hole; current size is {current_size}"
            )));
        }

        let block_start = round_down(offset, self.block_size as u64);
        let in_block_off = (offset - block_start) as u32;

        // Direct-write fast path: buffer not positioned on this block, the
        // write starts block-aligned, and covers at least one full block.
        if in_block_off == 0
            && buf.len() >= self.block_size as usize
            && self.current_block != Some(block_start)
        {
            let full_blocks = buf.len() / self.block_size as usize;
            let direct_len = full_blocks * self.block_size as usize;
            let n = layer::write_all(self.next.as_mut(), &buf[..direct_len], offset)?;
            let end = offset + n as u64;
            if end > self.file_size {
                self.file_size = end;
                self.size_confirmed = true;
            }
            if n < direct_len {
                return Ok(n);
            }
            let rest = self.write(&buf[direct_len..], offset + direct_len as u64)?;
            return Ok(direct_len + rest);
        }

        self.position_to_buffer(offset)?;
        self.ensure_loaded()?;

        if in_block_off > self.current_size {
            return Err(StackError::logic(format!(
                "write at in-block offset {in_block_off} would create a hole; \
                 buffer only holds {} valid bytes",
                self.current_size
            )));
        }

        let space = self.block_size - in_block_off;
        let n = buf.len().min(space as usize);
        let start = in_block_off as usize;
        self.buf[start..start + n].copy_from_slice(&buf[..n]);
        self.current_size = self.current_size.max(in_block_off + n as u32);
        self.dirty = true;

        let end = block_start + (in_block_off as u64) + n as u64;
        if end > self.file_size {
            self.file_size = end;
            self.size_confirmed = true;
        }

        Ok(n)
    }

    fn sync(&mut self) -> StackResult<()> {
        self.flush()?;
        self.next.sync()
    }

    fn size(&mut self) -> StackResult<u64> {
        if self.size_confirmed {
            return Ok(self.file_size);
        }
        self.flush()?;
        let size = self.next.size()?;
        self.file_size = size;
        self.size_confirmed = true;
        Ok(size)
    }

    #[instrument(skip_all, level = "trace")]
    fn resize(&mut self, new_size: u64) -> StackResult<()> {
        // Purges any buffered dirty data rather than flushing it first.
        self.current_block = None;
        self.current_size = 0;
        self.dirty = false;

        self.next.resize(new_size)?;
        self.file_size = new_size;
        self.size_confirmed = true;
        Ok(())
    }

    fn close(&mut self) -> StackResult<()> {
        let flush_result = self.flush();
        if let Err(err) = flush_result {
            self.state.record_first_error(err);
        }
        if let Err(err) = self.next.close() {
            self.state.record_first_error(err);
        }
        match self.state.last_error() {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }

    fn block_size(&self) -> u32 {
        1
    }

    fn eof(&self) -> bool {
        self.state.eof()
    }

    fn last_error(&self) -> Option<&StackError> {
        self.state.last_error()
    }

    fn clear_error(&mut self) {
        self.state.clear();
    }
}
