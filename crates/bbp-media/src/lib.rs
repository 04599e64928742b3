//! Storage media for blackboard persistence.
//!
//! A medium stores numbered deltas and tracks which contiguous range of them
//! is currently valid. Each medium is owned by one live agent instance at a
//! time; a second instance taking over makes the first one's ownership
//! check fail.
//!
//! # Media
//!
//! - [`PlainFileMedium`] -- one directory per agent, synchronous writes
//! - [`QueuedFileMedium`] -- same layout, writes queued to a background thread
//! - [`DatabaseMedium`] -- one redb table per agent
//! - [`NoOpMedium`] -- discards everything
//!
//! All of them implement [`StorageMedium`]. [`open_medium`] builds one from a
//! [`MediumConfig`].
//!
//! # Modules
//!
//! - [`medium`] -- the [`StorageMedium`] contract and [`MediumSettings`]
//! - [`config`] -- [`MediumConfig`] and defaults
//! - [`file`], [`fsops`], [`buffered`], [`mutex`] -- the file media
//! - [`database`] -- the redb medium and its shared connection
//! - [`noop`] -- the discarding medium
//! - [`factory`] -- [`open_medium`]

pub mod buffered;
pub mod config;
pub mod database;
pub mod error;
pub mod factory;
pub mod file;
pub mod fsops;
pub mod medium;
pub mod mutex;
pub mod noop;

pub use buffered::{BufferPoolConfig, BufferedFileSystem};
pub use config::{
    MediumConfig, MediumKind, DEFAULT_CONSOLIDATION_PERIOD, DEFAULT_LOCK_TIMEOUT,
    DEFAULT_PERSISTENCE_INTERVAL,
};
pub use database::{Connection, ConnectionGate, DatabaseMedium};
pub use error::{MediaError, Result};
pub use factory::{open_medium, DEFAULT_ROOT};
pub use file::{inspect_directory, DeltaFile, DirectoryListing, FileMedium, PlainFileMedium, QueuedFileMedium, SequenceFile};
pub use fsops::{DirectFs, FileOps};
pub use medium::{DeltaSink, MediumSettings, StorageMedium};
pub use mutex::FileMutex;
pub use noop::NoOpMedium;
