//! The concrete named scenarios (S1-S6) that seed the test suite, plus the
//! LZ4 round-trip scenario which is exercised directly against the layer
//! trait since the facade has no open-flag selector for it.

mod common;

use std::sync::Arc;

use iostack::facade::{Descriptor, StackSelector};
use iostack::host::{RawOpenOptions, StdFilesystem};
use iostack::layer::LayerPrototype;
use iostack::lz4::{Lz4Config, Lz4Prototype};
use iostack::raw::RawPrototype;

use common::{content, random_block_order};

#[test]
fn s1_plain_buffered_round_trip() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "s1");

    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    let data = content(1024);
    assert_eq!(desc.write_seq(&data).unwrap(), 1024);
    assert_eq!(desc.size().unwrap(), 1024);
    desc.close().unwrap();

    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    desc.seek(0);
    let mut buf = vec![0u8; 1024];
    assert_eq!(desc.read_seq(&mut buf).unwrap(), 1024);
    assert_eq!(buf, data);

    let mut tail = [0u8; 16];
    assert_eq!(desc.read_seq(&mut tail).unwrap(), 0);
    assert!(desc.eof());
    desc.close().unwrap();
}

#[test]
fn s2_boundary_sensitive_buffered() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "s2");

    let f = 1027usize;
    let b = 1024usize;
    let data = content(f);

    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    assert_eq!(desc.write_seq(&data).unwrap(), f);
    desc.close().unwrap();

    let desc = Descriptor::open_with_registry(&path, common::flags(StackSelector::Plain), &host, &registry);
    let nblocks = (f + b - 1) / b;
    for block in random_block_order(nblocks) {
        let start = block * b;
        let len = b.min(f - start);
        let mut buf = vec![0u8; len];
        assert_eq!(desc.read_at(&mut buf, start as u64).unwrap(), len);
        assert_eq!(buf, data[start..start + len]);
    }
    desc.close().unwrap();
}

#[test]
fn s3_aead_small_file() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "s3");

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    assert_eq!(desc.write_seq(&[0xAB]).unwrap(), 1);
    desc.close().unwrap();

    let raw_size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(raw_size, 1 + 8 + 16);

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    assert_eq!(desc.size().unwrap(), 1);
    let mut buf = [0u8; 1];
    assert_eq!(desc.read_at(&mut buf, 0).unwrap(), 1);
    assert_eq!(buf, [0xAB]);
    desc.close().unwrap();
}

#[test]
fn s4_aead_terminator_invariant() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "s4");

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    let data = content(1024);
    assert_eq!(desc.write_seq(&data).unwrap(), 1024);
    desc.close().unwrap();

    let raw_size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(raw_size, 1072);

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    assert!(desc.is_open());
    desc.close().unwrap();

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

#[test]
fn s5_lz4_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "s5");
    let filesystem = Arc::new(StdFilesystem);

    let prototype = Lz4Prototype::new(
        Box::new(RawPrototype::new(filesystem.clone())),
        filesystem.clone(),
        Lz4Config { block_size: 1024 },
    );

    let f = 7 * 1024usize;
    let data = content(f);
    let opts = RawOpenOptions {
        read: true,
        write: true,
        create: true,
        truncate: false,
    };

    let mut layer = prototype.open(&path, opts).unwrap();
    for block in 0..7 {
        let start = block * 1024;
        layer.write(&data[start..start + 1024], start as u64).unwrap();
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
    assert_eq!(layer.size().unwrap(), f as u64);

    for block in random_block_order(7) {
        let start = block * 1024;
        let mut buf = [0u8; 1024];
        assert_eq!(layer.read(&mut buf, start as u64).unwrap(), 1024);
        assert_eq!(buf[..], data[start..start + 1024]);
    }
    layer.close().unwrap();
}

#[test]
fn s6_append_under_aead() {
    let host = common::test_host();
    let registry = common::build_registry(&host, 1024);
    let dir = tempfile::tempdir().unwrap();
    let path = common::temp_path(&dir, "s6");

    let desc = Descriptor::open_with_registry(
        &path,
        common::flags(StackSelector::EncryptSession),
        &host,
        &registry,
    );
    desc.close().unwrap();

    let mut append_flags = common::flags(StackSelector::EncryptSession);
    append_flags.append = true;
    let desc = Descriptor::open_with_registry(&path, append_flags, &host, &registry);
    let data = content(1024);
    assert_eq!(desc.write_seq(&data).unwrap(), 1024);
    desc.close().unwrap();

    let mut read_flags = common::flags(StackSelector::EncryptSession);
    read_flags.write = false;
    let desc = Descriptor::open_with_registry(&path, read_flags, &host, &registry);
    assert_eq!(desc.size().unwrap(), 1024);
    let mut buf = vec![0u8; 1024];
    assert_eq!(desc.read_at(&mut buf, 0).unwrap(), 1024);
    assert_eq!(buf, data);
    desc.close().unwrap();
}
