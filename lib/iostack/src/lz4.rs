//! LZ4 layer (C3): length-prefixed compressed blocks with a sidecar offset
//! index, allowing random reads over a sequentially written compressed file.
//! Only the last block may ever be rewritten.

use std::{path::Path, path::PathBuf, sync::Arc};

use tracing::instrument;

use crate::{
    error::{StackError, StackResult},
    host::{Filesystem, RawFile, RawOpenOptions},
    layer::{self, Layer, LayerPrototype, LayerState},
};

const TRAILER_SIZE: u64 = 16;
const SIDECAR_SUFFIX: &str = ".lz4idx";

/// Configuration for an [`Lz4Prototype`]: the plaintext block size `B`.
#[derive(Clone, Copy, Debug)]
pub struct Lz4Config {
    pub block_size: u32,
}

impl Default for Lz4Config {
    fn default() -> Self {
        Self { block_size: 8192 }
    }
}

pub struct Lz4Prototype {
    inner: Box<dyn LayerPrototype>,
    filesystem: Arc<dyn Filesystem>,
    config: Lz4Config,
}

impl Lz4Prototype {
    pub fn new(
        inner: Box<dyn LayerPrototype>,
        filesystem: Arc<dyn Filesystem>,
        config: Lz4Config,
    ) -> Self {
        Self {
            inner,
            filesystem,
            config,
        }
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(SIDECAR_SUFFIX);
        PathBuf::from(s)
    }
}

impl LayerPrototype for Lz4Prototype {
    #[instrument(skip_all, level = "trace")]
    fn open(&self, path: &Path, opts: RawOpenOptions) -> StackResult<Box<dyn Layer>> {
        let mut next = self.inner.open(path, opts)?;
        let block_size = self.config.block_size as u64;
        let raw_size = next.size()?;
        let writable = opts.write;
        let sidecar_path = Self::sidecar_path(path);

        let (compressed_size, plaintext_size, index) = if raw_size == 0 {
            (0u64, 0u64, Vec::new())
        } else {
            let compressed_data_size = layer::read_u64(next.as_mut(), raw_size - TRAILER_SIZE)?;
            let plaintext_size = layer::read_u64(next.as_mut(), raw_size - 8)?;
            let index_size = raw_size - TRAILER_SIZE - compressed_data_size;
            let mut index_bytes = vec![0u8; index_size as usize];
            layer::read_all(next.as_mut(), &mut index_bytes, compressed_data_size)?;
            let index: Vec<u64> = index_bytes
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
                .collect();

            if writable {
                next.resize(compressed_data_size)?;
            }

            (compressed_data_size, plaintext_size, index)
        };

        let sidecar = if writable {
            let mut file = self
                .filesystem
                .open(
                    &sidecar_path,
                    RawOpenOptions {
                        read: true,
                        write: true,
                        create: true,
                        truncate: true,
                    },
                )
                .map_err(StackError::from)?;
            let mut offset = 0u64;
            for entry in &index {
                file.write_at(&entry.to_be_bytes(), offset)
                    .map_err(StackError::from)?;
                offset += 8;
            }
            Some(file)
        } else {
            None
        };

        Ok(Box::new(Lz4Layer {
            next,
            block_size,
            compressed_size,
            plaintext_size,
            index,
            sidecar,
            sidecar_path,
            filesystem: Arc::clone(&self.filesystem),
            writable,
            state: LayerState::default(),
        }))
    }

    fn block_size(&self) -> u32 {
        self.config.block_size
    }
}

pub struct Lz4Layer {
    next: Box<dyn Layer>,
    block_size: u64,
    compressed_size: u64,
    plaintext_size: u64,
    index: Vec<u64>,
    sidecar: Option<Box<dyn RawFile>>,
    sidecar_path: PathBuf,
    filesystem: Arc<dyn Filesystem>,
    writable: bool,
    state: LayerState,
}

impl Lz4Layer {
    fn decompress_at(&mut self, compressed_offset: u64) -> StackResult<Vec<u8>> {
        let len = layer::read_u32(self.next.as_mut(), compressed_offset)? as usize;
        let mut compressed = vec![0u8; len];
        layer::read_all(self.next.as_mut(), &mut compressed, compressed_offset + 4)?;
        lz4_flex::block::decompress_size_prepended(&compressed)
            .map_err(|e| StackError::corruption(format!("LZ4 block decompression failed: {e}")))
    }

    fn append_block(&mut self, plaintext: &[u8]) -> StackResult<()> {
        let compressed = lz4_flex::block::compress_prepend_size(plaintext);
        let record_off = self.compressed_size;
        layer::write_u32(self.next.as_mut(), record_off, compressed.len() as u32)?;
        layer::write_all(self.next.as_mut(), &compressed, record_off + 4)?;

        let block_index = self.index.len();
        self.index.push(record_off);
        if let Some(sidecar) = self.sidecar.as_mut() {
            sidecar
                .write_at(&record_off.to_be_bytes(), (block_index as u64) * 8)
                .map_err(StackError::from)?;
        }
        self.compressed_size = record_off + 4 + compressed.len() as u64;
        Ok(())
    }

    fn rewrite_last_block(&mut self, block_index: u64, plaintext: &[u8]) -> StackResult<()> {
        let record_off = self.index[block_index as usize];
        self.next.resize(record_off)?;
        self.compressed_size = record_off;

        let compressed = lz4_flex::block::compress_prepend_size(plaintext);
        layer::write_u32(self.next.as_mut(), record_off, compressed.len() as u32)?;
        layer::write_all(self.next.as_mut(), &compressed, record_off + 4)?;
        self.compressed_size = record_off + 4 + compressed.len() as u64;
        Ok(())
    }

    fn truncate_index_to(&mut self, nblocks: u64) -> StackResult<()> {
        self.index.truncate(nblocks as usize);
        if let Some(sidecar) = self.sidecar.as_mut() {
            sidecar
                .set_len(nblocks * 8)
                .map_err(StackError::from)?;
        }
        Ok(())
    }
}

impl Layer for Lz4Layer {
    #[instrument(skip_all, level = "trace")]
    fn read(&mut self, buf: &mut [u8], offset: u64) -> StackResult<usize> {
        if offset % self.block_size != 0 {
            return Err(StackError::logic(format!(
                "LZ4 read offset {offset} is not a multiple of block size {}",
                self.block_size
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let block_index = offset / self.block_size;
        if block_index >= self.index.len() as u64 {
            self.state.set_eof(true);
            return Ok(0);
        }

        let record_off = self.index[block_index as usize];
        let plaintext = self.decompress_at(record_off)?;
        let n = buf.len().min(plaintext.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        self.state.set_eof(false);
        Ok(n)
    }

    #[instrument(skip_all, level = "trace")]
    fn write(&mut self, buf: &[u8], offset: u64) -> StackResult<usize> {
        if offset % self.block_size != 0 {
            return Err(StackError::logic(format!(
                "LZ4 write offset {offset} is not a multiple of block size {}",
                self.block_size
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let block_index = offset / self.block_size;
        let nblocks = self.index.len() as u64;
        let l = buf.len().min(self.block_size as usize);

        if block_index > nblocks {
            return Err(StackError::logic(format!(
                "LZ4 write at block {block_index} would create a hole past block {nblocks}"
            )));
        }

        if block_index == nblocks {
            self.append_block(&buf[..l])?;
        } else if block_index + 1 == nblocks {
            self.rewrite_last_block(block_index, &buf[..l])?;
        } else {
            return Err(StackError::logic(
                "LZ4 write to a non-last compressed block is rejected",
            ));
        }

        let end = block_index * self.block_size + l as u64;
        if block_index + 1 >= nblocks || end > self.plaintext_size {
            self.plaintext_size = end;
        }
        Ok(l)
    }

    fn sync(&mut self) -> StackResult<()> {
        self.next.sync()
    }

    fn size(&mut self) -> StackResult<u64> {
        Ok(self.plaintext_size)
    }

    #[instrument(skip_all, level = "trace")]
    fn resize(&mut self, new_size: u64) -> StackResult<()> {
        if !self.writable {
            return Err(StackError::logic(
                "LZ4 layer can only be resized when open for writing",
            ));
        }
        if new_size == self.plaintext_size {
            return Ok(());
        }
        if new_size > self.plaintext_size {
            return Err(StackError::logic(
                "LZ4 layer does not support extending a compressed file",
            ));
        }

        if new_size % self.block_size == 0 {
            let new_nblocks = new_size / self.block_size;
            if new_nblocks < self.index.len() as u64 {
                let boundary = self.index[new_nblocks as usize];
                self.next.resize(boundary)?;
                self.compressed_size = boundary;
                self.truncate_index_to(new_nblocks)?;
            }
            self.plaintext_size = new_size;
        } else {
            let block_index = new_size / self.block_size;
            let block_start = block_index * self.block_size;
            let l_new = (new_size - block_start) as usize;

            let record_off = self.index[block_index as usize];
            let existing = self.decompress_at(record_off)?;
            self.next.resize(record_off)?;
            self.compressed_size = record_off;
            self.truncate_index_to(block_index)?;

            self.append_block(&existing[..l_new])?;
            self.plaintext_size = new_size;
        }
        Ok(())
    }

    fn close(&mut self) -> StackResult<()> {
        if self.writable {
            let index_bytes: Vec<u8> = self
                .index
                .iter()
                .flat_map(|off| off.to_be_bytes())
                .collect();

            let result = (|| -> StackResult<()> {
                layer::write_all(self.next.as_mut(), &index_bytes, self.compressed_size)?;
                let trailer_off = self.compressed_size + index_bytes.len() as u64;
                layer::write_u64(self.next.as_mut(), trailer_off, self.compressed_size)?;
                layer::write_u64(self.next.as_mut(), trailer_off + 8, self.plaintext_size)?;
                Ok(())
            })();

            if let Err(err) = result {
                self.state.record_first_error(err);
            }
            if let Err(err) = self.filesystem.delete(&self.sidecar_path) {
                self.state.record_first_error(err.into());
            }
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
        self.block_size as u32
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
