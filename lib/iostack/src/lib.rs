//! A composable, block-oriented file I/O stack for a database server.
//!
//! Layers present a uniform byte-level file interface — open, random
//! read/write, sequential read/write, truncate/extend, sync, size, close,
//! error inspection — while transparently providing buffering, authenticated
//! encryption, and optional block compression over an underlying virtual
//! file descriptor. See [`facade`] for the entry point most callers want.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod aead;
pub mod buffered;
pub mod error;
pub mod facade;
pub mod host;
pub mod layer;
pub mod lz4;
pub mod raw;

pub use error::{StackError, StackResult, E_IOSTACK};
pub use facade::{Descriptor, Host, OpenFlags, StackRegistry, StackSelector};
pub use layer::{Layer, LayerPrototype};
