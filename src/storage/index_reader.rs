use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;
use crate::compression::vbyte::VByteEncoder;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{Direction, Protocol, StreamId};
use crate::mmap::{MmapFile, SectionReader};
use crate::storage::format::{
    FileHeader, HostGroupRecord, ImportRecord, PacketRecord, Section, StreamRecord, HEADER_SIZE,
    SECTION_ALIGNMENT, STREAM_FLAGS_PROTOCOL,
};

const NANOS_PER_SECOND: i128 = 1_000_000_000;
const WRAP_MICROS: i64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub filename: String,
    pub packet_index_offset: u64,
}

/// One physical packet of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub timestamp: DateTime<Utc>,
    pub pcap_filename: String,
    pub pcap_index: u64,
    pub direction: Direction,
}

/// Payload transmitted in one direction at (about) one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataChunk {
    pub direction: Direction,
    pub content: Vec<u8>,
    pub time: DateTime<Utc>,
}

/// Per-direction payload plus chunk boundaries.
///
/// `chunk_offsets` starts with `[0, 0]` and has one entry per chunk holding the cumulative
/// `[client, server]` byte counts at the end of that chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamData {
    pub data: [Vec<u8>; 2],
    pub chunk_offsets: Vec<[usize; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideInfo {
    pub host: IpAddr,
    pub port: u16,
    pub bytes: u64,
}

/// JSON summary of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: u64,
    pub protocol: &'static str,
    pub client: SideInfo,
    pub server: SideInfo,
    pub first_packet: DateTime<Utc>,
    pub last_packet: DateTime<Utc>,
    pub index: String,
}

/// Read-only view of a finalized index file.
///
/// Opening validates the header, every section's bounds and record sizes, the import table,
/// the host groups and every stream record's references; afterwards all accessors are
/// bounds-checked reads on the mapped file.
pub struct IndexReader {
    path: PathBuf,
    file: MmapFile,
    header: FileHeader,
    reference_time: DateTime<Utc>,
    chunk_split_threshold: TimeDelta,
    imports: Vec<ImportEntry>,
    host_groups: Vec<Vec<IpAddr>>,
    id_to_index: HashMap<u64, u32>,
    stream_id_bounds: Option<(u64, u64)>,
    first_packet_bounds: Option<(u64, u64)>,
    last_packet_bounds: Option<(u64, u64)>,
}

impl std::fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexReader")
            .field("path", &self.path)
            .field("streams", &self.stream_count())
            .field("reference_time", &self.reference_time)
            .finish()
    }
}

fn offset_time(base: DateTime<Utc>, nanos: i128) -> DateTime<Utc> {
    let nanos = nanos.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
    base.checked_add_signed(TimeDelta::nanoseconds(nanos))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl IndexReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, &Config::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let with_path = |err: Error| Error::new(err.kind, format!("{}: {}", path.display(), err.context));

        let file = MmapFile::open_read_only(&path, HEADER_SIZE)?;
        let header = FileHeader::decode(file.data()).map_err(with_path)?;
        let reference_time = i64::try_from(header.first_packet_time)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| Error::corrupt("reference time out of range"))
            .map_err(with_path)?;
        let mut reader = IndexReader {
            path: path.clone(),
            file,
            header,
            reference_time,
            chunk_split_threshold: TimeDelta::milliseconds(config.chunk_split_threshold_ms as i64),
            imports: Vec::new(),
            host_groups: Vec::new(),
            id_to_index: HashMap::new(),
            stream_id_bounds: None,
            first_packet_bounds: None,
            last_packet_bounds: None,
        };
        reader.load().map_err(with_path)?;
        debug!(
            path = %path.display(),
            streams = reader.stream_count(),
            packets = reader.packet_count(),
            "opened index"
        );
        Ok(reader)
    }

    fn load(&mut self) -> Result<()> {
        self.check_sections()?;
        self.load_imports()?;
        self.load_host_groups()?;
        self.load_streams()
    }

    fn check_sections(&self) -> Result<()> {
        let file_len = self.file.len as u64;
        for section in Section::ALL {
            let range = self.header.section(section);
            if range.begin < HEADER_SIZE as u64
                || range.begin > range.end
                || range.end > file_len
                || range.begin % SECTION_ALIGNMENT != 0
            {
                return Err(Error::corrupt(format!(
                    "{} section [{}, {}) is out of bounds",
                    section.name(),
                    range.begin,
                    range.end
                )));
            }
        }
        self.section(Section::Packets).check_record_size::<PacketRecord>()?;
        self.section(Section::HostGroups).check_record_size::<HostGroupRecord>()?;
        self.section(Section::Imports).check_record_size::<ImportRecord>()?;
        self.section(Section::Streams).check_record_size::<StreamRecord>()?;
        for (section, size) in [(Section::V4Hosts, 4), (Section::V6Hosts, 16)] {
            if self.section(section).len() % size != 0 {
                return Err(Error::corrupt(format!(
                    "{} section size is not a multiple of {}",
                    section.name(),
                    size
                )));
            }
        }
        let stream_count = self.stream_count();
        for section in Section::LOOKUPS {
            if self.section(section).len() != stream_count * 4 {
                return Err(Error::corrupt(format!(
                    "{} lookup has {} bytes for {} streams",
                    section.name(),
                    self.section(section).len(),
                    stream_count
                )));
            }
        }
        Ok(())
    }

    fn load_imports(&mut self) -> Result<()> {
        let filenames = self.section(Section::ImportFilenames).data();
        let imports = self.section(Section::Imports);
        let mut entries = Vec::with_capacity(imports.record_count::<ImportRecord>());
        for i in 0..imports.record_count::<ImportRecord>() {
            let record: ImportRecord = imports.record(i)?;
            let name = usize::try_from(record.filename_offset)
                .ok()
                .and_then(|start| filenames.get(start..))
                .and_then(|rest| rest.iter().position(|&b| b == 0).map(|end| &rest[..end]))
                .ok_or_else(|| Error::corrupt(format!("import {} has no filename", i)))?;
            let filename = String::from_utf8(name.to_vec())
                .map_err(|_| Error::corrupt(format!("import {} filename is not UTF-8", i)))?;
            entries.push(ImportEntry {
                filename,
                packet_index_offset: record.packet_index_offset,
            });
        }
        self.imports = entries;
        Ok(())
    }

    fn load_host_groups(&mut self) -> Result<()> {
        let v4 = self.section(Section::V4Hosts);
        let v6 = self.section(Section::V6Hosts);
        let groups = self.section(Section::HostGroups);
        let mut host_groups = Vec::with_capacity(groups.record_count::<HostGroupRecord>());
        for i in 0..groups.record_count::<HostGroupRecord>() {
            let record: HostGroupRecord = groups.record(i)?;
            let size = if record.is_v6() { 16 } else { 4 };
            let blob = if record.is_v6() { v6 } else { v4 };
            let bytes = blob.bytes(record.start as usize * size, record.host_count() * size)?;
            let hosts = bytes
                .chunks_exact(size)
                .map(|host| match <[u8; 16]>::try_from(host) {
                    Ok(octets) => IpAddr::V6(Ipv6Addr::from(octets)),
                    Err(_) => IpAddr::V4(Ipv4Addr::new(host[0], host[1], host[2], host[3])),
                })
                .collect();
            host_groups.push(hosts);
        }
        self.host_groups = host_groups;
        Ok(())
    }

    fn load_streams(&mut self) -> Result<()> {
        let streams = self.section(Section::Streams);
        let stream_count = self.stream_count();
        let packet_count = self.packet_count();
        let data_len = self.section(Section::Data).len() as u64;
        let mut id_to_index = HashMap::with_capacity(stream_count);
        let mut bounds: Option<(u64, u64)> = None;
        for i in 0..stream_count {
            let record: StreamRecord = streams.record(i)?;
            let hosts = self.host_groups.get(record.host_group as usize).ok_or_else(|| {
                Error::corrupt(format!("stream {} references host group {}", i, record.host_group))
            })?;
            if record.client_host as usize >= hosts.len() || record.server_host as usize >= hosts.len() {
                return Err(Error::corrupt(format!("stream {} references a missing host", i)));
            }
            if record.packet_info_start as usize >= packet_count {
                return Err(Error::corrupt(format!("stream {} references a missing packet", i)));
            }
            if record.data_start >= data_len {
                return Err(Error::corrupt(format!("stream {} data starts outside the data section", i)));
            }
            if id_to_index.insert(record.stream_id, i as u32).is_some() {
                return Err(Error::corrupt(format!("stream id {} stored twice", record.stream_id)));
            }
            bounds = Some(match bounds {
                None => (record.stream_id, record.stream_id),
                Some((min, max)) => (min.min(record.stream_id), max.max(record.stream_id)),
            });
        }
        for section in Section::LOOKUPS {
            let lookup = self.section(section);
            for position in 0..stream_count {
                if lookup.u32_at(position * 4)? as usize >= stream_count {
                    return Err(Error::corrupt(format!(
                        "{} lookup references a missing stream",
                        section.name()
                    )));
                }
            }
        }
        let mut first_packet_bounds = None;
        let mut last_packet_bounds = None;
        if stream_count != 0 {
            let at = |section, position| -> Result<StreamRecord> {
                streams.record(self.lookup(section, position)? as usize)
            };
            let last = stream_count - 1;
            first_packet_bounds = Some((
                at(Section::ByFirstPacketTime, 0)?.first_packet_time_ns,
                at(Section::ByFirstPacketTime, last)?.first_packet_time_ns,
            ));
            last_packet_bounds = Some((
                at(Section::ByLastPacketTime, 0)?.last_packet_time_ns,
                at(Section::ByLastPacketTime, last)?.last_packet_time_ns,
            ));
        }
        self.id_to_index = id_to_index;
        self.stream_id_bounds = bounds;
        self.first_packet_bounds = first_packet_bounds;
        self.last_packet_bounds = last_packet_bounds;
        Ok(())
    }

    pub(crate) fn section(&self, section: Section) -> SectionReader<'_> {
        let range = self.header.section(section);
        let data = self
            .file
            .data()
            .get(range.begin as usize..range.end as usize)
            .unwrap_or(&[]);
        SectionReader::new(section.name(), data)
    }

    /// Stream position stored at `position` of a lookup section.
    pub(crate) fn lookup(&self, section: Section, position: usize) -> Result<u32> {
        self.section(section).u32_at(position * 4)
    }

    /// Every stream position, ordered by the lookup `section`.
    pub(crate) fn lookup_order(&self, section: Section) -> Result<Vec<u32>> {
        (0..self.stream_count()).map(|i| self.lookup(section, i)).collect()
    }

    fn id_at(&self, position: usize) -> Result<u64> {
        let index = self.lookup(Section::ByStreamId, position)?;
        let record: StreamRecord = self.section(Section::Streams).record(index as usize)?;
        Ok(record.stream_id)
    }

    /// Positions of the streams with an id in `min..=max`, in id order.
    pub(crate) fn positions_in_id_range(&self, min: u64, max: u64) -> Result<Vec<u32>> {
        if min > max {
            return Ok(Vec::new());
        }
        let count = self.stream_count();
        let (mut low, mut high) = (0, count);
        while low < high {
            let middle = low + (high - low) / 2;
            if self.id_at(middle)? < min {
                low = middle + 1;
            } else {
                high = middle;
            }
        }
        let mut positions = Vec::new();
        for position in low..count {
            if self.id_at(position)? > max {
                break;
            }
            positions.push(self.lookup(Section::ByStreamId, position)?);
        }
        Ok(positions)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream_count(&self) -> usize {
        self.section(Section::Streams).record_count::<StreamRecord>()
    }

    pub fn packet_count(&self) -> usize {
        self.section(Section::Packets).record_count::<PacketRecord>()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub fn import(&self, id: u32) -> Result<&ImportEntry> {
        self.imports
            .get(id as usize)
            .ok_or_else(|| Error::corrupt(format!("{}: missing import {}", self.path.display(), id)))
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub(crate) fn reference_secs(&self) -> u64 {
        self.header.first_packet_time
    }

    pub(crate) fn reference_nanos(&self) -> i128 {
        self.header.first_packet_time as i128 * NANOS_PER_SECOND
    }

    pub fn min_stream_id(&self) -> Option<StreamId> {
        self.stream_id_bounds.map(|(min, _)| StreamId(min))
    }

    pub fn max_stream_id(&self) -> Option<StreamId> {
        self.stream_id_bounds.map(|(_, max)| StreamId(max))
    }

    /// Earliest and latest first-packet time, as nanoseconds since the epoch.
    pub fn first_packet_bounds(&self) -> Option<(i128, i128)> {
        let base = self.reference_nanos();
        self.first_packet_bounds
            .map(|(min, max)| (base + min as i128, base + max as i128))
    }

    /// Earliest and latest last-packet time, as nanoseconds since the epoch.
    pub fn last_packet_bounds(&self) -> Option<(i128, i128)> {
        let base = self.reference_nanos();
        self.last_packet_bounds
            .map(|(min, max)| (base + min as i128, base + max as i128))
    }

    pub fn contains_stream(&self, id: StreamId) -> bool {
        self.id_to_index.contains_key(&id.0)
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.id_to_index.keys().map(|&id| StreamId(id))
    }

    pub fn stream_index(&self, id: StreamId) -> Option<u32> {
        self.id_to_index.get(&id.0).copied()
    }

    pub fn stream_by_index(&self, index: u32) -> Result<Stream<'_>> {
        let record = self.section(Section::Streams).record(index as usize)?;
        Ok(Stream {
            reader: self,
            index,
            record,
        })
    }

    pub fn stream_by_id(&self, id: StreamId) -> Result<Option<Stream<'_>>> {
        match self.stream_index(id) {
            Some(index) => self.stream_by_index(index).map(Some),
            None => Ok(None),
        }
    }

    /// Stream whose first packet is packet `index` of capture `filename`.
    pub fn stream_by_first_packet_source(&self, filename: &str, index: u64) -> Result<Option<Stream<'_>>> {
        let count = self.stream_count();
        let (mut low, mut high) = (0, count);
        while low < high {
            let middle = low + (high - low) / 2;
            let stream = self.stream_by_index(self.lookup(Section::ByFirstPacketSource, middle)?)?;
            if stream.first_packet_source()? < (filename, index) {
                low = middle + 1;
            } else {
                high = middle;
            }
        }
        if low == count {
            return Ok(None);
        }
        let stream = self.stream_by_index(self.lookup(Section::ByFirstPacketSource, low)?)?;
        if stream.first_packet_source()? == (filename, index) {
            Ok(Some(stream))
        } else {
            Ok(None)
        }
    }

    pub fn streams(&self) -> impl Iterator<Item = Result<Stream<'_>>> + '_ {
        (0..self.stream_count()).map(move |i| self.stream_by_index(i as u32))
    }

    pub fn all_streams<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Stream<'_>) -> Result<()>,
    {
        for stream in self.streams() {
            visit(stream?)?;
        }
        Ok(())
    }

    /// Releases the mapping. The file itself is left in place.
    pub fn close(self) {
        debug!(path = %self.path.display(), "closed index");
    }
}

/// A stream record together with the reader it was read from.
#[derive(Clone, Copy)]
pub struct Stream<'r> {
    reader: &'r IndexReader,
    index: u32,
    record: StreamRecord,
}

impl<'r> Stream<'r> {
    pub fn id(&self) -> StreamId {
        StreamId(self.record.stream_id)
    }

    /// Position of the stream within its index file.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn reader(&self) -> &'r IndexReader {
        self.reader
    }

    pub(crate) fn record(&self) -> &StreamRecord {
        &self.record
    }

    pub fn client_host(&self) -> IpAddr {
        self.reader.host_groups[self.record.host_group as usize][self.record.client_host as usize]
    }

    pub fn server_host(&self) -> IpAddr {
        self.reader.host_groups[self.record.host_group as usize][self.record.server_host as usize]
    }

    pub fn client_port(&self) -> u16 {
        self.record.client_port
    }

    pub fn server_port(&self) -> u16 {
        self.record.server_port
    }

    pub fn client_bytes(&self) -> u64 {
        self.record.client_bytes
    }

    pub fn server_bytes(&self) -> u64 {
        self.record.server_bytes
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_flags(self.record.flags & STREAM_FLAGS_PROTOCOL)
    }

    /// First packet time in nanoseconds since the epoch.
    pub fn first_packet_nanos(&self) -> i128 {
        self.reader.reference_nanos() + self.record.first_packet_time_ns as i128
    }

    /// Last packet time in nanoseconds since the epoch.
    pub fn last_packet_nanos(&self) -> i128 {
        self.reader.reference_nanos() + self.record.last_packet_time_ns as i128
    }

    pub fn first_packet(&self) -> DateTime<Utc> {
        offset_time(self.reader.reference_time, self.record.first_packet_time_ns as i128)
    }

    pub fn last_packet(&self) -> DateTime<Utc> {
        offset_time(self.reader.reference_time, self.record.last_packet_time_ns as i128)
    }

    fn expected_wraps(&self) -> i64 {
        let duration_us = self
            .record
            .last_packet_time_ns
            .saturating_sub(self.record.first_packet_time_ns)
            / 1000;
        ((duration_us + 1) >> 32) as i64
    }

    pub(crate) fn first_packet_source(&self) -> Result<(&'r str, u64)> {
        let packet: PacketRecord = self
            .reader
            .section(Section::Packets)
            .record(self.record.packet_info_start as usize)?;
        let import = self.reader.import(packet.import_id)?;
        Ok((
            import.filename.as_str(),
            import.packet_index_offset + packet.packet_index as u64,
        ))
    }

    /// The raw descriptor chain, including the slices of split payloads.
    pub(crate) fn packet_records(&self) -> Result<Vec<PacketRecord>> {
        let packets = self.reader.section(Section::Packets);
        let mut records = Vec::new();
        let mut index = self.record.packet_info_start as usize;
        loop {
            let packet: PacketRecord = packets.record(index)?;
            records.push(packet);
            if !packet.has_next() {
                return Ok(records);
            }
            index += 1;
        }
    }

    pub fn packets(&self) -> Result<Vec<Packet>> {
        let first = self.first_packet();
        let mut expect_wraps = self.expected_wraps();
        let mut wrap_base = 0i64;
        let mut last_rel = 0u32;
        let mut last_source = None;
        let mut packets = Vec::new();
        for record in self.packet_records()? {
            let source = (record.import_id, record.packet_index);
            if last_source == Some(source) {
                continue;
            }
            last_source = Some(source);
            if expect_wraps != 0 {
                if record.rel_time_us < last_rel {
                    wrap_base += WRAP_MICROS;
                    expect_wraps -= 1;
                }
                last_rel = record.rel_time_us;
            }
            let import = self.reader.import(record.import_id)?;
            packets.push(Packet {
                timestamp: offset_time(first, (wrap_base + record.rel_time_us as i64) as i128 * 1000),
                pcap_filename: import.filename.clone(),
                pcap_index: import.packet_index_offset + record.packet_index as u64,
                direction: record.direction(),
            });
        }
        Ok(packets)
    }

    /// Parses the chunk-size sequence; returns the non-empty chunks and the sequence length.
    fn chunk_sizes(&self) -> Result<(Vec<(Direction, usize)>, usize)> {
        let blob = self
            .reader
            .section(Section::Data)
            .tail(self.record.data_start as usize)?;
        let mut sizes = Vec::new();
        let mut totals = [0u64; 2];
        let mut offset = 0;
        let mut direction = Direction::ClientToServer;
        let mut previous_zero = false;
        loop {
            let (size, used) = VByteEncoder::decode_u64(blob.get(offset..).unwrap_or(&[]))?;
            offset += used;
            if size == 0 {
                if previous_zero {
                    break;
                }
                previous_zero = true;
            } else {
                previous_zero = false;
                totals[direction.index()] += size;
                let size = usize::try_from(size)
                    .map_err(|_| Error::corrupt("chunk size out of range"))?;
                sizes.push((direction, size));
            }
            direction = direction.reverse();
        }
        if totals != [self.record.client_bytes, self.record.server_bytes] {
            return Err(Error::corrupt(format!(
                "stream {}: chunk sizes {:?} do not add up to the byte counts",
                self.record.stream_id, totals
            )));
        }
        Ok((sizes, offset))
    }

    fn content(&self, header_len: usize) -> Result<[&'r [u8]; 2]> {
        let data = self.reader.section(Section::Data);
        let start = self.record.data_start as usize + header_len;
        let client_len = self.record.client_bytes as usize;
        let client = data.bytes(start, client_len)?;
        let server = data.bytes(start + client_len, self.record.server_bytes as usize)?;
        Ok([client, server])
    }

    /// The stream's whole data section entry (chunk sizes and payload), copied verbatim by merges.
    pub(crate) fn data_blob(&self) -> Result<&'r [u8]> {
        let (_, header_len) = self.chunk_sizes()?;
        let len = header_len + self.record.client_bytes as usize + self.record.server_bytes as usize;
        self.reader
            .section(Section::Data)
            .bytes(self.record.data_start as usize, len)
    }

    pub fn raw_data(&self) -> Result<StreamData> {
        let (sizes, header_len) = self.chunk_sizes()?;
        let [client, server] = self.content(header_len)?;
        let mut chunk_offsets = Vec::with_capacity(sizes.len() + 1);
        let mut current = [0usize; 2];
        chunk_offsets.push(current);
        for (direction, size) in sizes {
            current[direction.index()] += size;
            chunk_offsets.push(current);
        }
        Ok(StreamData {
            data: [client.to_vec(), server.to_vec()],
            chunk_offsets,
        })
    }

    /// Payload split into chunks: a chunk boundary is placed wherever the direction changes or
    /// two same-direction packets are further apart than the split threshold.
    pub fn data(&self) -> Result<Vec<DataChunk>> {
        let packets = self.reader.section(Section::Packets);
        let first = self.first_packet();
        let threshold = self.reader.chunk_split_threshold;
        let mut expect_wraps = self.expected_wraps();
        let mut wrap_base = 0i64;
        let mut last_rel = 0u32;
        let mut previous: Option<(Direction, DateTime<Utc>)> = None;
        let mut packet_times: [VecDeque<(DateTime<Utc>, usize)>; 2] = [VecDeque::new(), VecDeque::new()];

        let mut index = self.record.packet_info_start as usize;
        loop {
            let packet: PacketRecord = packets.record(index)?;
            if expect_wraps != 0 {
                if packet.rel_time_us < last_rel {
                    wrap_base += WRAP_MICROS;
                    expect_wraps -= 1;
                }
                last_rel = packet.rel_time_us;
            }
            if packet.data_size != 0 {
                let time = offset_time(first, (wrap_base + packet.rel_time_us as i64) as i128 * 1000);
                let direction = packet.direction();
                let times = &mut packet_times[direction.index()];
                match (times.back_mut(), previous) {
                    (Some(last), Some((previous_direction, previous_time)))
                        if previous_direction == direction && time - previous_time < threshold =>
                    {
                        last.1 += packet.data_size as usize;
                    }
                    _ => times.push_back((time, packet.data_size as usize)),
                }
                previous = Some((direction, time));
            }
            if !packet.has_next() {
                break;
            }
            index += 1;
            if expect_wraps == 0 {
                index += packet.skip as usize;
            }
        }

        let (sizes, header_len) = self.chunk_sizes()?;
        let content = self.content(header_len)?;
        let mut position = [0usize; 2];
        let mut chunks = Vec::new();
        for (direction, size) in sizes {
            let d = direction.index();
            let mut remaining = size;
            while remaining > 0 {
                let Some(front) = packet_times[d].front_mut() else {
                    return Err(Error::corrupt(format!(
                        "stream {}: more data than packet payload",
                        self.record.stream_id
                    )));
                };
                let take = remaining.min(front.1);
                let bytes = content[d]
                    .get(position[d]..position[d] + take)
                    .ok_or_else(|| Error::corrupt("chunk exceeds stream data"))?;
                chunks.push(DataChunk {
                    direction,
                    content: bytes.to_vec(),
                    time: front.0,
                });
                position[d] += take;
                remaining -= take;
                front.1 -= take;
                if front.1 == 0 {
                    packet_times[d].pop_front();
                }
            }
        }
        Ok(chunks)
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.record.stream_id,
            protocol: self.protocol().name(),
            client: SideInfo {
                host: self.client_host(),
                port: self.record.client_port,
                bytes: self.record.client_bytes,
            },
            server: SideInfo {
                host: self.server_host(),
                port: self.record.server_port,
                bytes: self.record.server_bytes,
            },
            first_packet: self.first_packet(),
            last_packet: self.last_packet(),
            index: self.reader.path.display().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.info())?)
    }
}

impl std::fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.record.stream_id)
            .field("index", &self.index)
            .field("reader", &self.reader.path)
            .finish()
    }
}
