use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory new index files (writer output, merge output) are created in.
    pub index_dir: PathBuf,

    // Stream::data chunking
    pub chunk_split_threshold_ms: u64,

    // Data condition matching
    pub max_regex_variants: usize,

    // Search defaults
    pub default_limit: usize,
    pub cancellation_check_interval: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            index_dir: PathBuf::from("./indexes"),
            chunk_split_threshold_ms: 50,   // same-direction packets closer than this share a chunk
            max_regex_variants: 10_000,     // precomputed variant combinations per data element
            default_limit: 100,
            cancellation_check_interval: 1, // check before every candidate stream
        }
    }
}

impl Config {
    pub fn with_index_dir(index_dir: impl Into<PathBuf>) -> Self {
        Config {
            index_dir: index_dir.into(),
            ..Config::default()
        }
    }

    pub fn chunk_split_threshold(&self) -> Duration {
        Duration::from_millis(self.chunk_split_threshold_ms)
    }
}
