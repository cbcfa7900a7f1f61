//! capflow: incremental loading of packet captures through external decoders.
//!
//! A [`Loader`] runs `tshark` (or anything speaking its PSML/PDML output) as
//! supervised subprocesses, streams summary rows to the caller as they are
//! parsed, keeps decoded detail trees in an LRU cache, and follows capture
//! files that are still growing. Every load runs under a generation; results
//! of superseded generations never reach the caller.

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod generation;
pub mod loader;
pub mod model;
pub mod parser;
pub mod process;
pub mod tail;

pub use cache::{ArtifactCache, CacheScope, CacheStats};
pub use config::Config;
pub use error::{Error, Result};
pub use generation::{LoadState, Tagged};
pub use loader::{Loader, LoaderEvent};
pub use model::{DetailArtifact, DetailNode, Generation, PacketRange, Source, SummaryRow};
