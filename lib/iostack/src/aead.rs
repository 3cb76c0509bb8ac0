//! AEAD layer (C2): per-block authenticated encryption with a fixed cipher
//! (AES-256-GCM). On-disk record: `ciphertext[L] || seq_be_u64 || tag[16]`.

use std::{path::Path, sync::Arc};

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use tracing::instrument;

use crate::{
    error::{StackError, StackResult},
    host::{RawOpenOptions, SequenceSource},
    layer::{self, Layer, LayerPrototype, LayerState},
};

const TAG_SIZE: u64 = 16;
const SEQ_SIZE: u64 = 8;
const NONCE_SIZE: usize = 12;

/// Configuration for an [`AeadPrototype`]: the plaintext block size `B` this
/// layer exposes to its caller. The on-disk record is `B + 8 + 16` bytes.
#[derive(Clone, Copy, Debug)]
pub struct AeadConfig {
    pub block_size: u32,
}

impl Default for AeadConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

pub struct AeadPrototype {
    inner: Box<dyn LayerPrototype>,
    config: AeadConfig,
    key: [u8; 32],
    sequence: Arc<dyn SequenceSource>,
}

impl AeadPrototype {
    pub fn new(
        inner: Box<dyn LayerPrototype>,
        config: AeadConfig,
        key: [u8; 32],
        sequence: Arc<dyn SequenceSource>,
    ) -> Self {
        Self {
            inner,
            config,
            key,
            sequence,
        }
    }

    fn record_size(&self) -> u64 {
        self.config.block_size as u64 + SEQ_SIZE + TAG_SIZE
    }
}

impl LayerPrototype for AeadPrototype {
    #[instrument(skip_all, level = "trace")]
    fn open(&self, path: &Path, opts: RawOpenOptions) -> StackResult<Box<dyn Layer>> {
        let mut next = self.inner.open(path, opts)?;
        let block_size = self.config.block_size;
        let record_size = self.record_size();

        let raw_size = next.size()?;
        let plaintext_size = if raw_size == 0 {
            0
        } else {
            if raw_size % record_size == 0 {
                return Err(StackError::corruption(
                    "AEAD file ends on a full record boundary with no terminator block",
                ));
            }
            let full_blocks = raw_size / record_size;
            let last_record_len = raw_size % record_size;
            if last_record_len < SEQ_SIZE + TAG_SIZE {
                return Err(StackError::corruption(
                    "AEAD trailing record shorter than sequence+tag overhead",
                ));
            }
            let last_l = last_record_len - SEQ_SIZE - TAG_SIZE;
            full_blocks * block_size as u64 + last_l
        };

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| StackError::logic(format!("invalid AES-256-GCM key: {e}")))?;

        let mut layer = AeadLayer {
            next,
            cipher,
            sequence: Arc::clone(&self.sequence),
            block_size,
            record_size,
            plaintext_size,
            state: LayerState::default(),
        };

        // Integrity check the trailing short block at open time, even when
        // it's empty (a zero-length record still carries a tag to verify).
        if raw_size > 0 {
            let last_block_index = plaintext_size / block_size as u64;
            let last_l = (plaintext_size - last_block_index * block_size as u64) as usize;
            layer
                .read_block_plaintext(last_block_index, last_l)
                .map_err(|_| {
                    StackError::corruption(
                        "trailing AEAD block failed authentication at open",
                    )
                })?;
        }

        Ok(Box::new(layer))
    }

    fn block_size(&self) -> u32 {
        self.config.block_size
    }
}

pub struct AeadLayer {
    next: Box<dyn Layer>,
    cipher: Aes256Gcm,
    sequence: Arc<dyn SequenceSource>,
    block_size: u32,
    record_size: u64,
    plaintext_size: u64,
    state: LayerState,
}

impl AeadLayer {
    fn nonce_for(block_index: u64, seq: u64) -> [u8; NONCE_SIZE] {
        let mut iv = [0u8; NONCE_SIZE];
        iv[..4].copy_from_slice(&(block_index as u32).to_be_bytes());
        iv[4..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    fn read_block_plaintext(&mut self, block_index: u64, l: usize) -> StackResult<Vec<u8>> {
        let record_off = block_index * self.record_size;
        let mut raw = vec![0u8; l + SEQ_SIZE as usize + TAG_SIZE as usize];
        layer::read_all(self.next.as_mut(), &mut raw, record_off)?;

        let seq = u64::from_be_bytes(raw[l..l + 8].try_into().unwrap());
        let iv = Self::nonce_for(block_index, seq);
        let nonce = Nonce::from_slice(&iv);

        let mut ciphertext_and_tag = Vec::with_capacity(l + TAG_SIZE as usize);
        ciphertext_and_tag.extend_from_slice(&raw[..l]);
        ciphertext_and_tag.extend_from_slice(&raw[l + 8..]);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext_and_tag,
                    aad: &seq.to_be_bytes(),
                },
            )
            .map_err(|_| StackError::corruption("AEAD tag verification failed"))
    }

    fn write_block(&mut self, block_index: u64, plaintext: &[u8]) -> StackResult<()> {
        let seq = self.sequence.next();
        let iv = Self::nonce_for(block_index, seq);
        let nonce = Nonce::from_slice(&iv);

        let out = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &seq.to_be_bytes(),
                },
            )
            .map_err(|e| StackError::logic(format!("AEAD encryption failed: {e}")))?;

        let l = plaintext.len();
        let mut record = Vec::with_capacity(l + SEQ_SIZE as usize + TAG_SIZE as usize);
        record.extend_from_slice(&out[..l]);
        record.extend_from_slice(&seq.to_be_bytes());
        record.extend_from_slice(&out[l..]);

        layer::write_all(self.next.as_mut(), &record, block_index * self.record_size)?;
        Ok(())
    }

    /// Appends a zero-length terminator block if the on-disk file currently
    /// ends on a full record boundary, so the trailing record's length stays
    /// unambiguous.
    fn ensure_terminator_invariant(&mut self) -> StackResult<()> {
        let raw_size = self.next.size()?;
        if raw_size > 0 && raw_size % self.record_size == 0 {
            let block_index = raw_size / self.record_size;
            self.write_block(block_index, &[])?;
        }
        Ok(())
    }
}

impl Layer for AeadLayer {
    #[instrument(skip_all, level = "trace")]
    fn read(&mut self, buf: &mut [u8], offset: u64) -> StackResult<usize> {
        if offset % self.block_size as u64 != 0 {
            return Err(StackError::logic(format!(
                "AEAD read offset {offset} is not a multiple of block size {}",
                self.block_size
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= self.plaintext_size {
            self.state.set_eof(true);
            return Ok(0);
        }

        let block_index = offset / self.block_size as u64;
        let block_start = block_index * self.block_size as u64;
        let l = (self.plaintext_size - block_start).min(self.block_size as u64) as usize;

        let plaintext = self.read_block_plaintext(block_index, l)?;
        let in_block_off = (offset - block_start) as usize;
        let n = buf.len().min(plaintext.len() - in_block_off);
        buf[..n].copy_from_slice(&plaintext[in_block_off..in_block_off + n]);
        self.state.set_eof(false);
        Ok(n)
    }

    #[instrument(skip_all, level = "trace")]
    fn write(&mut self, buf: &[u8], offset: u64) -> StackResult<usize> {
        if offset % self.block_size as u64 != 0 {
            return Err(StackError::logic(format!(
                "AEAD write offset {offset} is not a multiple of block size {}",
                self.block_size
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let block_index = offset / self.block_size as u64;
        let l = buf.len().min(self.block_size as usize);

        if l < self.block_size as usize && offset + l as u64 < self.plaintext_size {
            return Err(StackError::logic(
                "AEAD partial-block write before end of file",
            ));
        }

        self.write_block(block_index, &buf[..l])?;

        let end = offset + l as u64;
        if end > self.plaintext_size {
            self.plaintext_size = end;
        }
        Ok(l)
    }

    fn sync(&mut self) -> StackResult<()> {
        self.ensure_terminator_invariant()?;
        self.next.sync()
    }

    fn size(&mut self) -> StackResult<u64> {
        Ok(self.plaintext_size)
    }

    #[instrument(skip_all, level = "trace")]
    fn resize(&mut self, new_size: u64) -> StackResult<()> {
        use std::cmp::Ordering;

        match new_size.cmp(&self.plaintext_size) {
            Ordering::Equal => {}
            Ordering::Less => {
                let block_size = self.block_size as u64;
                if new_size % block_size == 0 {
                    let raw_offset = (new_size / block_size) * self.record_size;
                    self.next.resize(raw_offset)?;
                } else {
                    let block_index = new_size / block_size;
                    let block_start = block_index * block_size;
                    let l_new = (new_size - block_start) as usize;
                    let l_old = (self.plaintext_size - block_start).min(block_size) as usize;
                    let existing = self.read_block_plaintext(block_index, l_old)?;
                    let raw_offset = block_index * self.record_size;
                    self.next.resize(raw_offset)?;
                    self.plaintext_size = block_start;
                    self.write_block(block_index, &existing[..l_new])?;
                }
                self.plaintext_size = new_size;
                self.ensure_terminator_invariant()?;
            }
            Ordering::Greater => {
                let block_size = self.block_size as u64;
                if self.plaintext_size % block_size != 0 {
                    let block_index = self.plaintext_size / block_size;
                    let block_start = block_index * block_size;
                    let l_old = (self.plaintext_size - block_start) as usize;
                    let new_l = (new_size - block_start).min(block_size) as usize;
                    let mut padded = self.read_block_plaintext(block_index, l_old)?;
                    padded.resize(new_l, 0);
                    self.write_block(block_index, &padded)?;
                    self.plaintext_size = block_start + new_l as u64;
                }

                while self.plaintext_size + block_size <= new_size {
                    let block_index = self.plaintext_size / block_size;
                    self.write_block(block_index, &vec![0u8; block_size as usize])?;
                    self.plaintext_size += block_size;
                }

                if self.plaintext_size < new_size {
                    let block_index = self.plaintext_size / block_size;
                    let remainder = (new_size - self.plaintext_size) as usize;
                    self.write_block(block_index, &vec![0u8; remainder])?;
                    self.plaintext_size = new_size;
                }

                self.ensure_terminator_invariant()?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> StackResult<()> {
        if let Err(err) = self.ensure_terminator_invariant() {
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
        self.block_size
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
