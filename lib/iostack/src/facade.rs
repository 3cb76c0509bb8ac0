//! Top-level facade (C6): per-descriptor state, stack selection by open
//! flags, sequential read/write/seek, append semantics, and close lifecycle
//! wiring into the host's resource-owner mechanism.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, RwLock},
};

use tracing::{instrument, warn};

use crate::{
    error::{StackError, StackResult},
    host::{Filesystem, KeyProvider, ResourceOwner, SequenceSource, TempLimitAccountant},
    layer::{Layer, LayerPrototype},
    raw::RawPrototype,
};

/// The host-provided collaborators every open descriptor needs — the
/// external collaborators kept outside this crate's core.
pub struct Host {
    pub filesystem: Arc<dyn Filesystem>,
    pub resource_owner: Arc<dyn ResourceOwner>,
    pub temp_limit: Arc<dyn TempLimitAccountant>,
    pub sequence: Arc<dyn SequenceSource>,
    pub keys: Arc<dyn KeyProvider>,
}

/// Stack selector, one per open flag (`RAW`, `PLAIN`, `ENCRYPT`,
/// `ENCRYPT_PERM`, `TESTSTACK`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackSelector {
    Raw,
    Plain,
    EncryptSession,
    EncryptPermanent,
    Test,
}

/// Open flags, combining the standard POSIX-style bits with the
/// stack-selector and lifecycle flags.
#[derive(Clone, Copy, Debug)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    pub xact: bool,
    pub delete: bool,
    pub temp_limit: bool,
    pub transient: bool,
    pub selector: StackSelector,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
            xact: false,
            delete: false,
            temp_limit: false,
            transient: false,
            selector: StackSelector::Plain,
        }
    }
}

/// The process-wide prototype registry: built once at startup, read-only
/// afterward, with one
/// deliberate exception — the `TESTSTACK` slot, which tests swap at will.
pub struct StackRegistry {
    raw: Arc<dyn LayerPrototype>,
    plain: Arc<dyn LayerPrototype>,
    encrypt_session: Arc<dyn LayerPrototype>,
    encrypt_permanent: Arc<dyn LayerPrototype>,
    test: RwLock<Option<Arc<dyn LayerPrototype>>>,
}

impl StackRegistry {
    pub fn build(
        host: &Host,
        buffered: crate::buffered::BufferedConfig,
        aead: crate::aead::AeadConfig,
    ) -> StackRegistry {
        let raw: Arc<dyn LayerPrototype> = Arc::new(RawPrototype::new(Arc::clone(&host.filesystem)));

        let plain: Arc<dyn LayerPrototype> = Arc::new(crate::buffered::BufferedPrototype::new(
            Box::new(RawPrototype::new(Arc::clone(&host.filesystem))),
            buffered,
        ));

        let encrypt_session: Arc<dyn LayerPrototype> =
            Arc::new(crate::buffered::BufferedPrototype::new(
                Box::new(crate::aead::AeadPrototype::new(
                    Box::new(RawPrototype::new(Arc::clone(&host.filesystem))),
                    aead,
                    host.keys.session_key(),
                    Arc::clone(&host.sequence),
                )),
                buffered,
            ));

        let encrypt_permanent: Arc<dyn LayerPrototype> =
            Arc::new(crate::buffered::BufferedPrototype::new(
                Box::new(crate::aead::AeadPrototype::new(
                    Box::new(RawPrototype::new(Arc::clone(&host.filesystem))),
                    aead,
                    host.keys.permanent_key(),
                    Arc::clone(&host.sequence),
                )),
                buffered,
            ));

        StackRegistry {
            raw,
            plain,
            encrypt_session,
            encrypt_permanent,
            test: RwLock::new(None),
        }
    }

    /// Injects (or replaces) the prototype backing `StackSelector::Test`.
    pub fn set_test_prototype(&self, prototype: Arc<dyn LayerPrototype>) {
        *self.test.write().expect("test prototype lock poisoned") = Some(prototype);
    }

    fn prototype_for(&self, selector: StackSelector) -> StackResult<Arc<dyn LayerPrototype>> {
        match selector {
            StackSelector::Raw => Ok(Arc::clone(&self.raw)),
            StackSelector::Plain => Ok(Arc::clone(&self.plain)),
            StackSelector::EncryptSession => Ok(Arc::clone(&self.encrypt_session)),
            StackSelector::EncryptPermanent => Ok(Arc::clone(&self.encrypt_permanent)),
            StackSelector::Test => self
                .test
                .read()
                .expect("test prototype lock poisoned")
                .clone()
                .ok_or_else(|| StackError::logic("no TESTSTACK prototype has been injected")),
        }
    }
}

static REGISTRY: OnceLock<StackRegistry> = OnceLock::new();

/// One-shot process-wide registry initialization, guarded by an 'initialized'
/// flag"). Safe to call more than once; only the first call takes effect.
pub fn init_registry(registry: StackRegistry) {
    if REGISTRY.set(registry).is_err() {
        warn!("iostack registry already initialized; ignoring later call");
    }
}

fn registry() -> Option<&'static StackRegistry> {
    REGISTRY.get()
}

struct DescriptorState {
    stack: Option<Box<dyn Layer>>,
    offset: u64,
    file_size: u64,
    path: PathBuf,
    delete_on_close: bool,
    filesystem: Arc<dyn Filesystem>,
    temp_limit: Option<Arc<dyn TempLimitAccountant>>,
    last_error: Option<StackError>,
}

/// A single open file descriptor over the stack. Cheaply cloneable; clones
/// share the same underlying instance (needed so a resource-owner close
/// callback and the descriptor the caller holds see the same state).
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<Mutex<DescriptorState>>,
}

impl Descriptor {
    /// Opens `path` against the selector in `flags`, using the process-wide
    /// prototype registry installed by [`init_registry`]. Always returns a
    /// descriptor — on failure it carries only the error: open either
    /// fully succeeds or the returned instance carries an
    /// error"; check [`Descriptor::is_open`] or [`Descriptor::last_error`].
    #[instrument(skip(host), level = "debug")]
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags, host: &Host) -> Descriptor {
        let path = path.as_ref().to_path_buf();

        let registry = match registry() {
            Some(r) => r,
            None => {
                return Descriptor::closed_with_error(
                    path,
                    host,
                    flags,
                    StackError::logic("iostack registry not initialized"),
                )
            }
        };

        Descriptor::open_with_registry_inner(path, flags, host, registry)
    }

    /// Opens `path` against an explicit [`StackRegistry`] rather than the
    /// process-wide singleton. The one-shot global above is what a real
    /// host embeds this crate with; this entry point exists so callers that
    /// legitimately need more than one registry per process — most notably
    /// a test binary sweeping over several configured block sizes — aren't
    /// forced through `init_registry`'s single-initialization rule.
    pub fn open_with_registry(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        host: &Host,
        registry: &StackRegistry,
    ) -> Descriptor {
        Descriptor::open_with_registry_inner(path.as_ref().to_path_buf(), flags, host, registry)
    }

    fn open_with_registry_inner(
        path: PathBuf,
        flags: OpenFlags,
        host: &Host,
        registry: &StackRegistry,
    ) -> Descriptor {
        let prototype = match registry.prototype_for(flags.selector) {
            Ok(p) => p,
            Err(err) => return Descriptor::closed_with_error(path, host, flags, err),
        };

        let raw_opts = crate::host::RawOpenOptions {
            read: flags.read || flags.append,
            write: flags.write || flags.append,
            create: flags.create,
            truncate: flags.truncate,
        };

        let (mut stack, mut last_error) = match prototype.open(&path, raw_opts) {
            Ok(stack) => (Some(stack), None),
            Err(err) => (None, Some(err)),
        };

        let mut offset = 0u64;
        let mut file_size = 0u64;
        if let Some(layer) = stack.as_mut() {
            match layer.size() {
                Ok(size) => {
                    file_size = size;
                    if flags.append {
                        offset = size;
                    }
                }
                Err(err) => last_error = Some(err),
            }
        }

        let state = DescriptorState {
            stack,
            offset,
            file_size,
            path,
            delete_on_close: flags.delete,
            filesystem: Arc::clone(&host.filesystem),
            temp_limit: flags.temp_limit.then(|| Arc::clone(&host.temp_limit)),
            last_error,
        };

        let inner = Arc::new(Mutex::new(state));

        if flags.xact {
            let cb_inner = Arc::clone(&inner);
            host.resource_owner
                .register_xact_close(Box::new(move || {
                    let _ = Descriptor::close_inner(&cb_inner);
                }));
        }
        if flags.transient {
            let cb_inner = Arc::clone(&inner);
            host.resource_owner
                .register_subxact_close(Box::new(move || {
                    let _ = Descriptor::close_inner(&cb_inner);
                }));
        }

        Descriptor { inner }
    }

    fn closed_with_error(path: PathBuf, host: &Host, flags: OpenFlags, err: StackError) -> Descriptor {
        let state = DescriptorState {
            stack: None,
            offset: 0,
            file_size: 0,
            path,
            delete_on_close: flags.delete,
            filesystem: Arc::clone(&host.filesystem),
            temp_limit: None,
            last_error: Some(err),
        };
        Descriptor {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("descriptor mutex poisoned").stack.is_some()
    }

    /// Queries the last error, even on a closed or never-opened descriptor
    /// — the dummy-stack mechanism here is the
    /// `last_error` field retained on the descriptor's own state rather than
    /// the live layer stack once that stack is gone.
    pub fn last_error(&self) -> Option<StackError> {
        let guard = self.inner.lock().expect("descriptor mutex poisoned");
        if let Some(stack) = guard.stack.as_ref() {
            if let Some(err) = stack.last_error() {
                return Some(err.duplicate());
            }
        }
        guard.last_error.as_ref().map(StackError::duplicate)
    }

    pub fn eof(&self) -> bool {
        self.inner
            .lock()
            .expect("descriptor mutex poisoned")
            .stack
            .as_ref()
            .map(Layer::eof)
            .unwrap_or(false)
    }

    pub fn clear_error(&self) {
        let mut guard = self.inner.lock().expect("descriptor mutex poisoned");
        guard.last_error = None;
        if let Some(stack) = guard.stack.as_mut() {
            stack.clear_error();
        }
    }

    pub fn tell(&self) -> u64 {
        self.inner.lock().expect("descriptor mutex poisoned").offset
    }

    /// Updates only the cached sequential offset; never touches the
    /// underlying stack.
    pub fn seek(&self, offset: u64) {
        self.inner.lock().expect("descriptor mutex poisoned").offset = offset;
    }

    pub fn size(&self) -> StackResult<u64> {
        self.with_stack(Layer::size)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> StackResult<usize> {
        self.with_stack(|s| s.read(buf, offset))
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> StackResult<usize> {
        let n = self.with_stack(|s| s.write(buf, offset))?;
        let mut guard = self.inner.lock().expect("descriptor mutex poisoned");
        let end = offset + n as u64;
        if end > guard.file_size {
            let grown = (end - guard.file_size) as i64;
            guard.file_size = end;
            if let Some(accountant) = guard.temp_limit.clone() {
                accountant.reserve(grown);
            }
        }
        Ok(n)
    }

    pub fn read_seq(&self, buf: &mut [u8]) -> StackResult<usize> {
        let offset = self.tell();
        let n = self.read_at(buf, offset)?;
        self.inner.lock().expect("descriptor mutex poisoned").offset = offset + n as u64;
        Ok(n)
    }

    pub fn write_seq(&self, buf: &[u8]) -> StackResult<usize> {
        let offset = self.tell();
        let n = self.write_at(buf, offset)?;
        self.inner.lock().expect("descriptor mutex poisoned").offset = offset + n as u64;
        Ok(n)
    }

    pub fn sync(&self) -> StackResult<()> {
        self.with_stack(Layer::sync)
    }

    pub fn resize(&self, new_size: u64) -> StackResult<()> {
        self.with_stack(|s| s.resize(new_size))?;
        let mut guard = self.inner.lock().expect("descriptor mutex poisoned");
        guard.file_size = new_size;
        if guard.offset > new_size {
            guard.offset = new_size;
        }
        Ok(())
    }

    /// Closes the descriptor. Idempotent: closing an already-closed
    /// descriptor is a no-op success. Delete-on-close unlinks the path after
    /// the stack has finished closing.
    pub fn close(&self) -> StackResult<()> {
        Descriptor::close_inner(&self.inner)
    }

    fn close_inner(inner: &Arc<Mutex<DescriptorState>>) -> StackResult<()> {
        let mut guard = inner.lock().expect("descriptor mutex poisoned");
        let mut stack = match guard.stack.take() {
            Some(s) => s,
            None => return Ok(()),
        };

        let close_result = stack.close();
        if let Err(err) = &close_result {
            guard.last_error = Some(err.duplicate());
        }
        drop(stack);

        if guard.delete_on_close {
            if let Err(err) = guard.filesystem.delete(&guard.path) {
                if guard.last_error.is_none() {
                    guard.last_error = Some(err.into());
                }
            }
        }

        close_result
    }

    /// Dispatches a single-layer operation against the live stack.
    ///
    /// Per spec.md §4.6/§7/§9, a `Logic`/`Corruption` error (`E_IOSTACK`) is
    /// not something a caller is expected to recover from inline — it marks
    /// an invariant violation or a tampered file, not a transient OS
    /// condition — so the facade escalates it to a fatal panic instead of
    /// returning it. Plain OS errors (`errno`-bearing) still come back as an
    /// ordinary `Err`.
    fn with_stack<R>(&self, f: impl FnOnce(&mut dyn Layer) -> StackResult<R>) -> StackResult<R> {
        let mut guard = self.inner.lock().expect("descriptor mutex poisoned");
        let stack = match guard.stack.as_mut() {
            Some(s) => s,
            None => {
                return Err(guard
                    .last_error
                    .as_ref()
                    .map(StackError::duplicate)
                    .unwrap_or_else(|| {
                        StackError::logic("operation on a closed or never-opened descriptor")
                    }))
            }
        };
        let result = f(stack.as_mut());
        if let Err(err) = &result {
            guard.last_error = Some(err.duplicate());
            if err.is_logic_error() {
                let message = err.to_string();
                drop(guard);
                panic!("iostack: fatal I/O stack error (E_IOSTACK): {message}");
            }
        }
        result
    }
}
