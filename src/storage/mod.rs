pub mod format;
pub mod layout;
pub mod input;
pub mod index_writer;
pub mod index_reader;
pub mod merger;

pub use index_reader::{DataChunk, IndexReader, Packet, Stream, StreamData, StreamInfo};
pub use index_writer::IndexWriter;
pub use input::{PacketInput, PacketSource, StreamChunk, StreamInput};
pub use layout::IndexLayout;
pub use merger::{merge, MergeFailure};
