//! On-disk layout of an index file.
//!
//! ```text
//! [ HEADER: magic, first packet time, 12 x (begin, end) ]   <- byte 0
//! [ DATA: per stream varint chunk sizes, client bytes, server bytes ]
//! [ IMPORT FILENAMES ] [ IMPORTS ] [ PACKETS ] [ V4 HOSTS ] [ V6 HOSTS ]
//! [ HOST GROUPS ] [ STREAMS ] [ 4 x LOOKUP ]
//! ```
//!
//! All integers are little-endian and every section starts on an 8 byte boundary.

use crate::core::error::{Error, Result};
use crate::core::types::Direction;
use crate::mmap::section::{le_u16, le_u32, le_u64, le_u8};
use crate::mmap::FixedRecord;

pub const MAGIC: &[u8; 16] = b"streamdex index\x01";
pub const SECTION_COUNT: usize = 12;
pub const HEADER_SIZE: usize = 16 + 8 + SECTION_COUNT * 16;
pub const SECTION_ALIGNMENT: u64 = 8;

pub const MAX_PACKET_DATA: usize = u16::MAX as usize;
pub const MAX_HOSTS_PER_GROUP: usize = 1 << 16;
pub const MAX_HOST_GROUPS: usize = 1 << 16;
pub const MAX_SKIP: usize = u8::MAX as usize;

pub const PACKET_FLAG_HAS_NEXT: u8 = 0b01;
pub const PACKET_FLAG_SERVER_TO_CLIENT: u8 = 0b10;

pub const STREAM_FLAGS_PROTOCOL: u16 = 0b11;

pub const HOST_GROUP_FLAG_V6: u16 = 0b1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Data,
    Packets,
    V4Hosts,
    V6Hosts,
    HostGroups,
    Imports,
    ImportFilenames,
    Streams,
    ByStreamId,
    ByFirstPacketSource,
    ByFirstPacketTime,
    ByLastPacketTime,
}

impl Section {
    pub const ALL: [Section; SECTION_COUNT] = [
        Section::Data,
        Section::Packets,
        Section::V4Hosts,
        Section::V6Hosts,
        Section::HostGroups,
        Section::Imports,
        Section::ImportFilenames,
        Section::Streams,
        Section::ByStreamId,
        Section::ByFirstPacketSource,
        Section::ByFirstPacketTime,
        Section::ByLastPacketTime,
    ];

    pub const LOOKUPS: [Section; 4] = [
        Section::ByStreamId,
        Section::ByFirstPacketSource,
        Section::ByFirstPacketTime,
        Section::ByLastPacketTime,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Section::Data => "data",
            Section::Packets => "packets",
            Section::V4Hosts => "v4 hosts",
            Section::V6Hosts => "v6 hosts",
            Section::HostGroups => "host groups",
            Section::Imports => "imports",
            Section::ImportFilenames => "import filenames",
            Section::Streams => "streams",
            Section::ByStreamId => "by stream id",
            Section::ByFirstPacketSource => "by first packet source",
            Section::ByFirstPacketTime => "by first packet time",
            Section::ByLastPacketTime => "by last packet time",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionRange {
    pub begin: u64,
    pub end: u64,
}

impl SectionRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    /// Reference time of the file in seconds since the epoch.
    pub first_packet_time: u64,
    pub sections: [SectionRange; SECTION_COUNT],
}

impl FileHeader {
    pub fn section(&self, section: Section) -> SectionRange {
        self.sections[section.index()]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.first_packet_time.to_le_bytes());
        for range in &self.sections {
            out.extend_from_slice(&range.begin.to_le_bytes());
            out.extend_from_slice(&range.end.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let magic = bytes
            .get(..MAGIC.len())
            .ok_or_else(|| Error::corrupt("header truncated"))?;
        if magic != MAGIC {
            return Err(Error::corrupt(format!(
                "wrong magic {:?}, expected {:?}",
                String::from_utf8_lossy(magic),
                String::from_utf8_lossy(MAGIC)
            )));
        }
        let mut header = FileHeader {
            first_packet_time: le_u64(bytes, 16)?,
            ..FileHeader::default()
        };
        for (i, range) in header.sections.iter_mut().enumerate() {
            range.begin = le_u64(bytes, 24 + i * 16)?;
            range.end = le_u64(bytes, 32 + i * 16)?;
        }
        Ok(header)
    }
}

/// One descriptor per physical packet (or per 64 KiB slice of a larger payload).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketRecord {
    /// Microseconds since the stream's first packet, modulo 2^32.
    pub rel_time_us: u32,
    pub import_id: u32,
    pub packet_index: u32,
    pub data_size: u16,
    /// Number of following payload-less descriptors that can be skipped, 255 means 255 or more.
    pub skip: u8,
    pub flags: u8,
}

impl PacketRecord {
    pub fn has_next(&self) -> bool {
        self.flags & PACKET_FLAG_HAS_NEXT != 0
    }

    pub fn direction(&self) -> Direction {
        if self.flags & PACKET_FLAG_SERVER_TO_CLIENT != 0 {
            Direction::ServerToClient
        } else {
            Direction::ClientToServer
        }
    }
}

impl FixedRecord for PacketRecord {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.rel_time_us.to_le_bytes());
        out.extend_from_slice(&self.import_id.to_le_bytes());
        out.extend_from_slice(&self.packet_index.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out.push(self.skip);
        out.push(self.flags);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(PacketRecord {
            rel_time_us: le_u32(bytes, 0)?,
            import_id: le_u32(bytes, 4)?,
            packet_index: le_u32(bytes, 8)?,
            data_size: le_u16(bytes, 12)?,
            skip: le_u8(bytes, 14)?,
            flags: le_u8(bytes, 15)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRecord {
    pub stream_id: u64,
    pub first_packet_time_ns: u64,
    pub last_packet_time_ns: u64,
    /// Offset of the stream's chunk-size sequence within the data section.
    pub data_start: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub packet_info_start: u32,
    pub flags: u16,
    pub host_group: u16,
    pub client_host: u16,
    pub server_host: u16,
    pub client_port: u16,
    pub server_port: u16,
}

impl FixedRecord for StreamRecord {
    const SIZE: usize = 64;

    fn encode(&self, out: &mut Vec<u8>) {
        for v in [
            self.stream_id,
            self.first_packet_time_ns,
            self.last_packet_time_ns,
            self.data_start,
            self.client_bytes,
            self.server_bytes,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.packet_info_start.to_le_bytes());
        for v in [
            self.flags,
            self.host_group,
            self.client_host,
            self.server_host,
            self.client_port,
            self.server_port,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(StreamRecord {
            stream_id: le_u64(bytes, 0)?,
            first_packet_time_ns: le_u64(bytes, 8)?,
            last_packet_time_ns: le_u64(bytes, 16)?,
            data_start: le_u64(bytes, 24)?,
            client_bytes: le_u64(bytes, 32)?,
            server_bytes: le_u64(bytes, 40)?,
            packet_info_start: le_u32(bytes, 48)?,
            flags: le_u16(bytes, 52)?,
            host_group: le_u16(bytes, 54)?,
            client_host: le_u16(bytes, 56)?,
            server_host: le_u16(bytes, 58)?,
            client_port: le_u16(bytes, 60)?,
            server_port: le_u16(bytes, 62)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostGroupRecord {
    /// Index of the group's first host within its family's host section.
    pub start: u32,
    /// Host count minus one.
    pub count: u16,
    pub flags: u16,
}

impl HostGroupRecord {
    pub fn is_v6(&self) -> bool {
        self.flags & HOST_GROUP_FLAG_V6 != 0
    }

    pub fn host_count(&self) -> usize {
        self.count as usize + 1
    }
}

impl FixedRecord for HostGroupRecord {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(HostGroupRecord {
            start: le_u32(bytes, 0)?,
            count: le_u16(bytes, 4)?,
            flags: le_u16(bytes, 6)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportRecord {
    pub filename_offset: u64,
    pub packet_index_offset: u64,
}

impl FixedRecord for ImportRecord {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.filename_offset.to_le_bytes());
        out.extend_from_slice(&self.packet_index_offset.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(ImportRecord {
            filename_offset: le_u64(bytes, 0)?,
            packet_index_offset: le_u64(bytes, 8)?,
        })
    }
}

/// Zero bytes needed to move `len` to the next section boundary.
pub fn padding(len: u64) -> u64 {
    (SECTION_ALIGNMENT - len % SECTION_ALIGNMENT) % SECTION_ALIGNMENT
}
