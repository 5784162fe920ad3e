//! Query evaluation over a set of index readers.

pub mod context;
pub mod converters;
pub(crate) mod data;
pub mod executor;
pub(crate) mod filters;
pub(crate) mod results;

pub use context::{SearchContext, SubQuerySelection};
pub use converters::{CancellationToken, ConverterAccess, ConverterData, ConverterMap, TagDetails, TagSnapshot};
pub use executor::{search_streams, DataRegexes, SearchRequest, SearchResult};
