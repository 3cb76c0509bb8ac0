//! Contracts this crate consumes from its host process.
//!
//! These are external collaborators, not part of the core
//! design: the virtual-file-descriptor table, the resource-owner mechanism
//! that drives automatic close at end-of-transaction, the per-process
//! temp-file quota, the sequence-number generator backing AEAD IVs, and key
//! management. Each is modeled here as a small trait so the stack can be
//! exercised standalone (the `Null*`/`Atomic*` defaults below) as well as
//! embedded in a host that has real answers for all of them.

use std::{
    io,
    os::unix::fs::FileExt,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use zeroize::Zeroize;

/// How a raw file should be opened. Mirrors the standard POSIX open flags
/// the stack layers on top; the stack-specific selector
/// flags (`XACT`, `ENCRYPT`, ...) are consumed by [`crate::facade`], not by
/// this layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawOpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl RawOpenOptions {
    pub fn read_write_create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }
}

/// A single opened raw file, as handed back by [`Filesystem::open`].
///
/// This is the bottom of the stack: every layer above the raw layer (C1)
/// only ever talks to its successor through the [`crate::layer::Layer`]
/// trait, never through this one directly.
pub trait RawFile: Send {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn sync_all(&mut self) -> io::Result<()>;
    fn len(&mut self) -> io::Result<u64>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Zero-fill the gap when growing by a small amount: grow by <= 64 KiB
    /// writes zero bytes rather than preallocating.
    fn zero_fill(&mut self, offset: u64, len: u64) -> io::Result<()> {
        const CHUNK: usize = 8192;
        let zeros = [0u8; CHUNK];
        let mut remaining = len;
        let mut at = offset;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            self.write_at(&zeros[..n], at)?;
            at += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Preallocate (or best-effort emulate) space up to `len` bytes without
    /// necessarily writing zeros; falls back to `set_len` where the
    /// platform has no `fallocate`-equivalent.
    fn preallocate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Generalized interface for opening and deleting raw files.
///
/// Grounded in the same shape as a production/test filesystem seam: one
/// implementation backed by the real OS ([`StdFilesystem`]), others usable
/// for fault injection under the `TESTSTACK` selector.
pub trait Filesystem: Send + Sync {
    fn open(&self, path: &Path, opts: RawOpenOptions) -> io::Result<Box<dyn RawFile>>;
    fn delete(&self, path: &Path) -> io::Result<()>;
}

pub struct StdFile(std::fs::File);

impl RawFile for StdFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(&self.0, buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        FileExt::write_at(&self.0, buf, offset)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.0.sync_all()
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.0.set_len(len)
    }
}

/// The production filesystem: real `std::fs::File`s.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn open(&self, path: &Path, opts: RawOpenOptions) -> io::Result<Box<dyn RawFile>> {
        let file = std::fs::OpenOptions::new()
            .read(opts.read)
            .write(opts.write)
            .create(opts.create)
            .truncate(opts.truncate)
            .open(path)?;
        Ok(Box::new(StdFile(file)))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Drives automatic close at end-of-transaction or sub-transaction abort
/// (`XACT`/`TRANSIENT`). The host calls the registered
/// callback at the appropriate boundary; the default [`NullResourceOwner`]
/// never calls it, which is correct for standalone use where there is no
/// enclosing transaction.
pub trait ResourceOwner: Send + Sync {
    fn register_xact_close(&self, callback: Box<dyn FnOnce() + Send>);
    fn register_subxact_close(&self, callback: Box<dyn FnOnce() + Send>);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullResourceOwner;

impl ResourceOwner for NullResourceOwner {
    fn register_xact_close(&self, _callback: Box<dyn FnOnce() + Send>) {}
    fn register_subxact_close(&self, _callback: Box<dyn FnOnce() + Send>) {}
}

/// Per-process temp-file quota accounting (`TEMP_LIMIT`).
pub trait TempLimitAccountant: Send + Sync {
    fn reserve(&self, delta: i64);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullTempLimitAccountant;

impl TempLimitAccountant for NullTempLimitAccountant {
    fn reserve(&self, _delta: i64) {}
}

/// Generates the per-block sequence numbers that feed the AEAD layer's IV
/// construction. For temporary files the host is expected to
/// reset this across crashes and regenerate the key; this crate only needs
/// a monotonic source.
pub trait SequenceSource: Send + Sync {
    fn next(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct AtomicSequenceSource(AtomicU64);

impl AtomicSequenceSource {
    pub fn starting_at(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }
}

impl SequenceSource for AtomicSequenceSource {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Supplies the AES-256 key material for the two encrypted stack selectors
/// (`ENCRYPT` / session key, `ENCRYPT_PERM` / permanent key). Key management
/// itself is out of scope here; this crate only consumes bytes.
pub trait KeyProvider: Send + Sync {
    fn session_key(&self) -> [u8; 32];
    fn permanent_key(&self) -> [u8; 32];
}

/// A [`KeyProvider`] holding fixed key bytes, zeroized on drop.
///
/// Useful standalone and in tests; a real host will usually back this with
/// its own key management instead.
pub struct StaticKeyProvider {
    session: [u8; 32],
    permanent: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(session: [u8; 32], permanent: [u8; 32]) -> Self {
        Self { session, permanent }
    }
}

impl Drop for StaticKeyProvider {
    fn drop(&mut self) {
        self.session.zeroize();
        self.permanent.zeroize();
    }
}

impl KeyProvider for StaticKeyProvider {
    fn session_key(&self) -> [u8; 32] {
        self.session
    }

    fn permanent_key(&self) -> [u8; 32] {
        self.permanent
    }
}
