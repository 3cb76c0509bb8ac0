//! Universal properties plus AEAD/LZ4-specific properties, parameterized
//! over fixed file-size (`F`) and block-size (`B`) domains.

mod common;

use std::sync::Arc;

use proptest::prelude::*;
use proptest::sample::select;

use iostack::facade::{Descriptor, StackSelector};
use iostack::host::{RawOpenOptions, StdFilesystem};
use iostack::layer::LayerPrototype;
use iostack::lz4::{Lz4Config, Lz4Prototype};
use iostack::raw::RawPrototype;

const FILE_SIZES: [usize; 8] = [0, 1, 64, 1024, 1027, 7 * 1024, 32 * 1024 + 127, 6 * 1024 * 1024 + 153];
const BLOCK_SIZES: [u32; 6] = [1, 64, 1024 - 237, 1024, 3 * 1024 + 357, 4096];

fn fb_strategy() -> impl Strategy<Value = (usize, u32)> {
    (select(&FILE_SIZES[..]), select(&BLOCK_SIZES[..]))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Property 1 + 4: sequential round trip, and an extra read past the
    /// end returns 0 without setting an error.
    #[test]
    fn round_trip_streaming((f, b) in fb_strategy()) {
        let host = common::test_host();
        let registry = common::build_registry(&host, b);
        let dir = tempfile::tempdir().unwrap();
        let path = common::temp_path(&dir, "rt");

        let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
        let data = common::content(f);
        prop_assert_eq!(desc.write_seq(&data).unwrap(), f);
        desc.close().unwrap();

        let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
        desc.seek(0);
        let mut buf = vec![0u8; f];
        prop_assert_eq!(desc.read_seq(&mut buf).unwrap(), f);
        prop_assert_eq!(&buf, &data);

        let mut extra = [0u8; 8];
        prop_assert_eq!(desc.read_seq(&mut extra).unwrap(), 0);
        prop_assert!(desc.eof());
        prop_assert!(desc.last_error().is_none());
        desc.close().unwrap();
    }

    /// Property 2: random-access writes at pseudo-random block offsets
    /// produce the same file as sequential writing.
    #[test]
    fn random_access_round_trip((f, b) in fb_strategy()) {
        let host = common::test_host();
        let registry = common::build_registry(&host, b);
        let dir = tempfile::tempdir().unwrap();
        let path = common::temp_path(&dir, "ra");
        let data = common::content(f);
        let block = b as usize;
        let nblocks = if f == 0 { 0 } else { (f + block - 1) / block };

        let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
        for idx in common::random_block_order(nblocks) {
            let start = idx * block;
            let len = block.min(f - start);
            desc.write_at(&data[start..start + len], start as u64).unwrap();
        }
        desc.close().unwrap();

        let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
        prop_assert_eq!(desc.size().unwrap(), f as u64);
        let mut buf = vec![0u8; f];
        desc.seek(0);
        prop_assert_eq!(desc.read_seq(&mut buf).unwrap(), f);
        prop_assert_eq!(&buf, &data);
        desc.close().unwrap();
    }
}

/// Property 3: reopening with append preserves existing content and adds
/// the new block at the end.
#[test]
fn append_preserves_existing_content() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "append");

    let first = common::content(1027);
    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    desc.write_seq(&first).unwrap();
    desc.close().unwrap();

    let mut append_flags = common::flags(StackSelector::Plain);
    append_flags.append = true;
    let second = vec![0x42u8; 1024];
    let desc = Descriptor::open_with_registry(&path, append_flags, &host, &registry);
    assert_eq!(desc.tell(), 1027);
    desc.write_seq(&second).unwrap();
    desc.close().unwrap();

    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    let mut buf = vec![0u8; first.len() + second.len()];
    desc.seek(0);
    assert_eq!(desc.read_seq(&mut buf).unwrap(), buf.len());
    assert_eq!(&buf[..first.len()], &first[..]);
    assert_eq!(&buf[first.len()..], &second[..]);
    desc.close().unwrap();
}

/// Property 5: size query after an extending write reflects the new size
/// without an intervening sync.
#[test]
fn size_cache_coherence_without_sync() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "coherence");

    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    desc.write_at(&[1, 2, 3, 4], 4096).unwrap();
    assert_eq!(desc.size().unwrap(), 4100);
    desc.close().unwrap();
}

/// Property 6 (buffered half): a write at an offset past the current end is
/// not something the caller can recover from inline — the facade escalates
/// the buffered layer's hole-rejection `E_IOSTACK` to a fatal panic, per
/// spec.md §4.6/§7.
#[test]
#[should_panic(expected = "fatal I/O stack error")]
fn hole_rejection_buffered_is_fatal() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let plain_path = common::temp_path(&dir, "hole-plain");

    let desc = Descriptor::open_with_registry(&plain_path, common::flags(StackSelector::Plain), &host, &registry);
    desc.write_at(&[1, 2, 3], 0).unwrap();
    let _ = desc.write_at(&[9, 9], 64);
}

/// Property 6 (AEAD half): `Resize` to a larger size is not a hole at all —
/// it's a zero-filled extension, so it succeeds and reads back as zeros.
#[test]
fn aead_resize_extends_with_zeros() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let aead_path = common::temp_path(&dir, "hole-aead");

    let desc = Descriptor::open_with_registry(
        &aead_path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    desc.write_at(&common::content(1024), 0).unwrap();
    desc.resize(4096).unwrap();
    assert_eq!(desc.size().unwrap(), 4096);
    let mut tail = vec![0u8; 1024];
    desc.read_at(&mut tail, 3072).unwrap();
    assert!(tail.iter().all(|&b| b == 0));
    desc.close().unwrap();
}

/// Property 7: an unaligned offset at a block-exposing layer (AEAD, LZ4) is
/// rejected. The facade's own top (buffered) is always byte-granular, so
/// this is exercised directly against the layer trait.
#[test]
fn alignment_enforcement_on_block_layers() {
    let dir = tempfile::tempdir().unwrap();
    let filesystem = Arc::new(StdFilesystem);

    let aead_path = common::temp_path(&dir, "align-aead");
    let key_host = common::test_host();
    let aead_proto = iostack::aead::AeadPrototype::new(
        Box::new(RawPrototype::new(filesystem.clone())),
        iostack::aead::AeadConfig { block_size: 1024 },
        [1u8; 32],
        key_host.sequence.clone(),
    );
    let opts = RawOpenOptions {
        read: true,
        write: true,
        create: true,
        truncate: false,
    };
    let mut layer = aead_proto.open(&aead_path, opts).unwrap();
    let err = layer.write(&[0u8; 16], 10).unwrap_err();
    assert!(err.is_logic_error());
    layer.close().unwrap();

    let lz4_path = common::temp_path(&dir, "align-lz4");
    let lz4_proto = Lz4Prototype::new(
        Box::new(RawPrototype::new(filesystem.clone())),
        filesystem.clone(),
        Lz4Config { block_size: 1024 },
    );
    let mut layer = lz4_proto.open(&lz4_path, opts).unwrap();
    let err = layer.write(&[0u8; 16], 10).unwrap_err();
    assert!(err.is_logic_error());
    layer.close().unwrap();
}

/// AEAD property 8: extending the raw file by one byte is detected at open.
#[test]
fn aead_detects_one_byte_extension() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "ext");

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    desc.write_seq(&common::content(1024)).unwrap();
    desc.close().unwrap();

    let raw_size = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(raw_size + 1).unwrap();
    drop(file);

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    assert!(!desc.is_open());
    assert!(desc.last_error().unwrap().is_logic_error());
}

/// AEAD property 9: truncating the raw file by one byte is detected at open.
#[test]
fn aead_detects_one_byte_truncation() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "trunc");

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    desc.write_seq(&common::content(1024)).unwrap();
    desc.close().unwrap();

    let raw_size = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(raw_size - 1).unwrap();
    drop(file);

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    assert!(!desc.is_open());
    assert!(desc.last_error().unwrap().is_logic_error());
}

/// AEAD property 10: zeroing the trailing 4 bytes (same length) is detected.
#[test]
fn aead_detects_trailing_zeroed_bytes() {
    use std::io::{Seek, SeekFrom, Write};

    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "zeroed");

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    desc.write_seq(&common::content(1024)).unwrap();
    desc.close().unwrap();

    let raw_size = std::fs::metadata(&path).unwrap().len();
    let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(raw_size - 4)).unwrap();
    file.write_all(&[0u8; 4]).unwrap();
    drop(file);

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    assert!(!desc.is_open());
    assert!(desc.last_error().unwrap().is_logic_error());
}

/// AEAD property 11: after any successful close, the raw file never ends
/// exactly on a full-record boundary unless the plaintext is empty.
#[test]
fn aead_final_block_invariant_holds_across_sizes() {
    let host = common::test_host();
    for &f in &[0usize, 1, 1024, 1027, 7 * 1024] {
        let registry = common::build_registry(&host, 1024);
        let dir = tempfile::tempdir().unwrap();
        let path = common::temp_path(&dir, "invariant");

        let desc = Descriptor::open_with_registry(
            &path,
            common::flags(StackSelector::EncryptSession),
            &host,
            &registry,
        );
        desc.write_seq(&common::content(f)).unwrap();
        desc.close().unwrap();

        let raw_size = std::fs::metadata(&path).unwrap().len();
        let record_size = 1024u64 + 8 + 16;
        assert!(raw_size % record_size != 0 || f == 0);
    }
}

/// LZ4 property 12: after closing/reopening, a write to a non-last block is
/// rejected.
#[test]
fn lz4_rejects_non_last_block_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "nonlast");
    let filesystem = Arc::new(StdFilesystem);
    let prototype = Lz4Prototype::new(
        Box::new(RawPrototype::new(filesystem.clone())),
        filesystem.clone(),
        Lz4Config { block_size: 1024 },
    );

    let data = common::content(3 * 1024);
    let opts = RawOpenOptions {
        read: true,
        write: true,
        create: true,
        truncate: false,
    };
    let mut layer = prototype.open(&path, opts).unwrap();
    for block in 0..3 {
        layer
            .write(&data[block * 1024..(block + 1) * 1024], (block * 1024) as u64)
            .unwrap();
    }
    layer.close().unwrap();

    let mut layer = prototype.open(&path, opts).unwrap();
    let err = layer.write(&[0u8; 1024], 0).unwrap_err();
    assert!(err.is_logic_error());
    layer.close().unwrap();
}

/// LZ4 property 13: reading blocks in pseudo-random order reconstructs each
/// one exactly.
#[test]
fn lz4_random_read_correctness() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "randomread");
    let filesystem = Arc::new(StdFilesystem);
    let prototype = Lz4Prototype::new(
        Box::new(RawPrototype::new(filesystem.clone())),
        filesystem.clone(),
        Lz4Config { block_size: 1024 },
    );

    let data = common::content(6 * 1024);
    let opts = RawOpenOptions {
        read: true,
        write: true,
        create: true,
        truncate: false,
    };
    let mut layer = prototype.open(&path, opts).unwrap();
    for block in 0..6 {
        layer
            .write(&data[block * 1024..(block + 1) * 1024], (block * 1024) as u64)
            .unwrap();
    }
    layer.close().unwrap();

    let mut layer = prototype
        .open(
            &path,
            RawOpenOptions {
                read: true,
                write: false,
                create: false,
                truncate: false,
            },
        )
        .unwrap();
    for block in common::random_block_order(6) {
        let mut buf = [0u8; 1024];
        layer.read(&mut buf, (block * 1024) as u64).unwrap();
        assert_eq!(buf[..], data[block * 1024..(block + 1) * 1024]);
    }
    layer.close().unwrap();
}
