use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::index_reader::IndexReader;
use crate::storage::index_writer::{IndexWriter, WriterLimits};
use crate::storage::layout::IndexLayout;

/// A merge that stopped part-way.
///
/// `kept` holds the output files that were finalized before the failure; they are complete
/// and valid. Every other output file has been removed.
pub struct MergeFailure {
    pub kept: Vec<IndexReader>,
    pub error: Error,
}

impl fmt::Debug for MergeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeFailure")
            .field("kept", &self.kept.iter().map(|r| r.path()).collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for MergeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge failed after {} output files: {}", self.kept.len(), self.error)
    }
}

impl std::error::Error for MergeFailure {}

/// Merges `readers` (oldest first) into new index files under `config.index_dir`.
///
/// Streams are copied newest reader first, so when a stream id occurs in several inputs the
/// version from the newest input wins. Inputs are never modified.
pub fn merge(
    config: &Config,
    readers: &[&IndexReader],
) -> std::result::Result<Vec<IndexReader>, MergeFailure> {
    merge_with_limits(config, readers, WriterLimits::default())
}

pub(crate) fn merge_with_limits(
    config: &Config,
    readers: &[&IndexReader],
    limits: WriterLimits,
) -> std::result::Result<Vec<IndexReader>, MergeFailure> {
    info!(inputs = readers.len(), dir = %config.index_dir.display(), "merging indexes");
    let fail = |error| MergeFailure {
        kept: Vec::new(),
        error,
    };
    let layout = IndexLayout::new(config.index_dir.clone()).map_err(fail)?;

    let mut writers: Vec<IndexWriter> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    for reader in readers.iter().rev() {
        if let Err(error) = add_reader(&layout, limits, &mut writers, reader, &seen) {
            discard_all(writers);
            return Err(fail(error));
        }
        seen.extend(reader.stream_ids().map(|id| id.0));
    }

    let outputs = finalize_all(writers)?;
    info!(inputs = readers.len(), outputs = outputs.len(), "merged indexes");
    Ok(outputs)
}

fn add_reader(
    layout: &IndexLayout,
    limits: WriterLimits,
    writers: &mut Vec<IndexWriter>,
    reader: &IndexReader,
    seen: &HashSet<u64>,
) -> Result<()> {
    for writer in writers.iter_mut() {
        if writer.add_index_excluding(reader, seen)? {
            return Ok(());
        }
    }
    let mut writer = IndexWriter::with_limits(layout.new_index_path(), limits)?;
    match writer.add_index_excluding(reader, seen) {
        Ok(true) => {
            writers.push(writer);
            Ok(())
        }
        Ok(false) => {
            discard_logged(writer);
            Err(Error::new(
                ErrorKind::InvalidState,
                format!("{} does not fit into an empty index", reader.path().display()),
            ))
        }
        Err(err) => {
            discard_logged(writer);
            Err(err)
        }
    }
}

fn finalize_all(writers: Vec<IndexWriter>) -> std::result::Result<Vec<IndexReader>, MergeFailure> {
    let mut kept = Vec::with_capacity(writers.len());
    let mut writers = writers.into_iter();
    while let Some(writer) = writers.next() {
        match writer.finalize() {
            Ok(reader) => kept.push(reader),
            Err(error) => {
                warn!(kept = kept.len(), error = %error, "merge failed, removing unfinished outputs");
                discard_all(writers);
                return Err(MergeFailure { kept, error });
            }
        }
    }
    Ok(kept)
}

fn discard_all(writers: impl IntoIterator<Item = IndexWriter>) {
    for writer in writers {
        discard_logged(writer);
    }
}

fn discard_logged(writer: IndexWriter) {
    let path = writer.path().to_path_buf();
    if let Err(err) = writer.discard() {
        warn!(path = %path.display(), error = %err, "failed to remove merge output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Direction, Protocol, StreamId};
    use crate::storage::input::{PacketSource, StreamInput};
    use chrono::{Duration, TimeZone, Utc};
    use std::fs;

    fn stream(client: &str, seconds: i64, payload: &[u8]) -> StreamInput {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds);
        let mut stream = StreamInput::new(client.parse().unwrap(), "10.1.0.1:80".parse().unwrap(), Protocol::Tcp);
        stream.push_packet(
            start,
            Direction::ClientToServer,
            PacketSource {
                filename: "merge.pcap".to_string(),
                index: seconds as u64,
            },
            payload,
        );
        stream
    }

    fn write(path: std::path::PathBuf, streams: &[(u64, StreamInput)]) -> IndexReader {
        let mut writer = IndexWriter::new(path).unwrap();
        for (id, input) in streams {
            assert!(writer.add_stream(input, StreamId(*id)).unwrap());
        }
        writer.finalize().unwrap()
    }

    #[test]
    fn newest_input_wins() {
        let dir = tempfile::tempdir().unwrap();
        let old = write(
            dir.path().join("old.idx"),
            &[(1, stream("10.0.0.1:1", 0, b"old")), (2, stream("10.0.0.2:1", 1, b"two"))],
        );
        let new = write(dir.path().join("new.idx"), &[(1, stream("10.0.0.1:1", 5, b"new!"))]);
        let config = Config::with_index_dir(dir.path().join("merged"));

        let merged = merge(&config, &[&old, &new]).unwrap();
        assert_eq!(merged.len(), 1);
        let reader = &merged[0];
        assert_eq!(reader.stream_count(), 2);
        let one = reader.stream_by_id(StreamId(1)).unwrap().unwrap();
        assert_eq!(one.raw_data().unwrap().data[0], b"new!".to_vec());
        assert_eq!(one.first_packet(), new.stream_by_id(StreamId(1)).unwrap().unwrap().first_packet());
        assert!(old.path().exists());
        assert!(new.path().exists());
    }

    #[test]
    fn overflow_spreads_over_several_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<IndexReader> = (0..4u64)
            .map(|i| {
                write(
                    dir.path().join(format!("in{}.idx", i)),
                    &[(i, stream(&format!("10.0.0.{}:1", i + 2), i as i64, b"x"))],
                )
            })
            .collect();
        let refs: Vec<&IndexReader> = inputs.iter().collect();
        let limits = WriterLimits {
            streams: 3,
            ..WriterLimits::default()
        };
        let config = Config::with_index_dir(dir.path().join("merged"));
        let merged = merge_with_limits(&config, &refs, limits).unwrap();
        assert_eq!(merged.iter().map(|r| r.stream_count()).collect::<Vec<_>>(), vec![3, 1]);
        // newest inputs are merged first
        assert!(merged[1].contains_stream(StreamId(0)));
    }

    #[test]
    fn failed_finalize_keeps_finished_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = IndexWriter::new(dir.path().join("a.idx")).unwrap();
        first.add_stream(&stream("10.0.0.1:1", 0, b"a"), StreamId(1)).unwrap();
        let mut second = IndexWriter::new(dir.path().join("b.idx")).unwrap();
        second.add_stream(&stream("10.0.0.2:1", 1, b"b"), StreamId(2)).unwrap();
        let third = IndexWriter::new(dir.path().join("c.idx")).unwrap();
        // the finished file cannot be reopened once its path is gone
        fs::remove_file(second.path()).unwrap();

        let failure = finalize_all(vec![first, second, third]).unwrap_err();
        assert_eq!(failure.kept.len(), 1);
        assert_eq!(failure.error.kind, ErrorKind::Io);
        assert!(dir.path().join("a.idx").exists());
        assert!(!dir.path().join("c.idx").exists());
    }
}
