use std::sync::{Arc, Once};

use iostack::aead::AeadConfig;
use iostack::buffered::BufferedConfig;
use iostack::facade::{Host, OpenFlags, StackRegistry, StackSelector};
use iostack::host::{
    AtomicSequenceSource, NullResourceOwner, NullTempLimitAccountant, StaticKeyProvider,
    StdFilesystem,
};

static TRACING: Once = Once::new();

/// Installs a `RUST_LOG`-filtered `fmt` subscriber once per test binary,
/// the same shape as the teacher's own `install_tracing_helpers`: quiet by
/// default, opt-in verbosity via `RUST_LOG`.
fn install_tracing() {
    TRACING.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "off".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn test_host() -> Host {
    install_tracing();
    Host {
        filesystem: Arc::new(StdFilesystem),
        resource_owner: Arc::new(NullResourceOwner),
        temp_limit: Arc::new(NullTempLimitAccountant),
        sequence: Arc::new(AtomicSequenceSource::starting_at(0)),
        keys: Arc::new(StaticKeyProvider::new([7u8; 32], [9u8; 32])),
    }
}

/// Builds a fresh registry configured with the given block size.
///
/// Deliberately not routed through `facade::init_registry`'s process-wide
/// `OnceLock` — that single-initialization rule is right for a real host
/// embedding the crate, but it would make every test after the first one in
/// a binary silently ignore its own block size. Tests call
/// `Descriptor::open_with_registry` with the registry returned here instead.
pub fn build_registry(host: &Host, block_size: u32) -> StackRegistry {
    StackRegistry::build(
        host,
        BufferedConfig { block_size },
        AeadConfig { block_size },
    )
}

pub fn flags(selector: StackSelector) -> OpenFlags {
    OpenFlags {
        read: true,
        write: true,
        create: true,
        truncate: false,
        append: false,
        xact: false,
        delete: false,
        temp_limit: false,
        transient: false,
        selector,
    }
}

pub fn temp_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

pub fn content(f: usize) -> Vec<u8> {
    (0..f).map(|i| (i % 251) as u8).collect()
}

/// A pseudo-random block visitation order (step prime 3197 modulo the
/// block count).
pub fn random_block_order(nblocks: usize) -> Vec<usize> {
    if nblocks == 0 {
        return Vec::new();
    }
    let mut order = Vec::with_capacity(nblocks);
    let mut idx = 0usize;
    for _ in 0..nblocks {
        order.push(idx);
        idx = (idx + 3197) % nblocks;
    }
    order
}
