pub mod mmap_file;
pub mod section;

pub use mmap_file::MmapFile;
pub use section::{FixedRecord, SectionReader};
