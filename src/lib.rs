//! Packet stream index: an immutable, memory mapped file format for captured TCP/UDP streams
//! and a query engine that searches across several such files.
//!
//! Indexes are built with [`IndexWriter`], opened with [`IndexReader`] and combined with
//! [`storage::merge`]. Queries are parsed by [`Query::parse`] and run by [`search_streams`].

pub mod analysis;
pub mod bitmask;
pub mod compression;
pub mod core;
pub mod mmap;
pub mod query;
pub mod search;
pub mod storage;

pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{Direction, Protocol, StreamId};
pub use query::{ConditionsSet, Query};
pub use search::{search_streams, SearchRequest, SearchResult};
pub use storage::{IndexLayout, IndexReader, IndexWriter, Stream, StreamInput};
