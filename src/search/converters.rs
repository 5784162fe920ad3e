//! Collaborators a search reads from: converter output, tag state and cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::bitmask::{Bitmask, LongBitmask};
use crate::core::error::{Error, Result};
use crate::core::types::StreamId;
use crate::query::conditions::ConditionsSet;
use crate::storage::StreamData;

/// Output of a converter for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConverterData {
    pub data: StreamData,
    pub client_bytes: u64,
    pub server_bytes: u64,
    /// `false` when the converter has not processed the stream yet; `data` is then empty and
    /// must not be searched.
    pub was_cached: bool,
}

/// Access to a converter's transformed stream data.
pub trait ConverterAccess {
    fn data_for_search(&self, stream: StreamId) -> Result<ConverterData>;
}

pub type ConverterMap = BTreeMap<String, Arc<dyn ConverterAccess + Send + Sync>>;

/// State of one tag at the time a search starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagDetails {
    /// The tag's own query.
    pub conditions: ConditionsSet,
    /// Stream ids known to match.
    pub matches: LongBitmask,
    /// Stream ids not evaluated against `conditions` yet.
    pub uncertain: LongBitmask,
}

impl TagDetails {
    pub fn new(conditions: ConditionsSet) -> Self {
        TagDetails {
            conditions,
            matches: LongBitmask::new(),
            uncertain: LongBitmask::new(),
        }
    }

    pub fn matches_stream(&self, id: StreamId) -> bool {
        self.matches.is_set(id.0 as usize)
    }

    pub fn is_uncertain(&self, id: StreamId) -> bool {
        self.uncertain.is_set(id.0 as usize)
    }
}

pub type TagSnapshot = BTreeMap<String, TagDetails>;

/// Cooperative cancellation shared between a search and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// A token that also cancels itself once `timeout` has passed.
    pub fn with_timeout(timeout: Duration) -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails with [`crate::core::error::ErrorKind::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            debug!(deadline_passed = self.deadline.is_some_and(|d| Instant::now() >= d), "search cancelled");
            return Err(Error::cancelled());
        }
        Ok(())
    }
}
