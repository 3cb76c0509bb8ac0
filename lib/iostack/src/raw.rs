//! Raw layer (C1): the bottom of every stack. Wraps the host's descriptor
//! operations and tracks file size; stateless apart from that.

use std::{path::Path, sync::Arc};

use tracing::instrument;

use crate::{
    error::{StackError, StackResult},
    host::{Filesystem, RawFile, RawOpenOptions},
    layer::{Layer, LayerPrototype, LayerState},
};

/// Grow requests at or below this size are zero-filled in place rather than
/// preallocated.
const ZERO_FILL_THRESHOLD: u64 = 64 * 1024;

pub struct RawPrototype {
    filesystem: Arc<dyn Filesystem>,
}

impl RawPrototype {
    pub fn new(filesystem: Arc<dyn Filesystem>) -> Self {
        Self { filesystem }
    }
}

impl LayerPrototype for RawPrototype {
    fn open(&self, path: &Path, opts: RawOpenOptions) -> StackResult<Box<dyn Layer>> {
        let mut file = self.filesystem.open(path, opts)?;
        let file_size = file.len()?;
        Ok(Box::new(RawLayer {
            file,
            file_size,
            state: LayerState::default(),
        }))
    }

    fn block_size(&self) -> u32 {
        1
    }
}

pub struct RawLayer {
    file: Box<dyn RawFile>,
    file_size: u64,
    state: LayerState,
}

impl Layer for RawLayer {
    #[instrument(skip_all, level = "trace")]
    fn read(&mut self, buf: &mut [u8], offset: u64) -> StackResult<usize> {
        if offset >= self.file_size {
            self.state.set_eof(true);
            return Ok(0);
        }
        let n = self.file.read_at(buf, offset)?;
        self.state.set_eof(n == 0);
        Ok(n)
    }

    #[instrument(skip_all, level = "trace")]
    fn write(&mut self, buf: &[u8], offset: u64) -> StackResult<usize> {
        let n = self.file.write_at(buf, offset)?;
        let end = offset + n as u64;
        if end > self.file_size {
            self.file_size = end;
        }
        Ok(n)
    }

    fn sync(&mut self) -> StackResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&mut self) -> StackResult<u64> {
        Ok(self.file_size)
    }

    #[instrument(skip_all, level = "trace")]
    fn resize(&mut self, new_size: u64) -> StackResult<()> {
        match new_size.cmp(&self.file_size) {
            std::cmp::Ordering::Less => {
                self.file.set_len(new_size)?;
            }
            std::cmp::Ordering::Equal => {}
            std::cmp::Ordering::Greater => {
                let grow_by = new_size - self.file_size;
                if grow_by <= ZERO_FILL_THRESHOLD {
                    self.file.zero_fill(self.file_size, grow_by)?;
                } else {
                    self.file.preallocate(new_size)?;
                }
            }
        }
        self.file_size = new_size;
        Ok(())
    }

    /// No successor to close and no buffers of its own to flush: the raw
    /// layer's close just surfaces whatever sticky error it already holds.
    /// Durability is an explicit [`Layer::sync`] away, never implied by
    /// close.
    fn close(&mut self) -> StackResult<()> {
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
