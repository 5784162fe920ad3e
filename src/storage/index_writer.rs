use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use crate::compression::vbyte::VByteEncoder;
use crate::core::error::{Error, Result};
use crate::core::types::{Direction, StreamId};
use crate::mmap::FixedRecord;
use crate::storage::format::{
    self, FileHeader, HostGroupRecord, ImportRecord, PacketRecord, Section, SectionRange,
    StreamRecord, HEADER_SIZE, HOST_GROUP_FLAG_V6, MAX_HOSTS_PER_GROUP, MAX_HOST_GROUPS,
    MAX_PACKET_DATA, MAX_SKIP, PACKET_FLAG_HAS_NEXT, PACKET_FLAG_SERVER_TO_CLIENT,
};
use crate::storage::index_reader::IndexReader;
use crate::storage::input::StreamInput;
use crate::storage::layout::IndexLayout;

const FLUSH_THRESHOLD: usize = 1024 * 1024;
const NANOS_PER_SECOND: i128 = 1_000_000_000;
const IMPORT_OFFSET_MASK: u64 = !(u32::MAX as u64);

/// Capacity of one index file; exceeding any of these makes `add_*` return `Ok(false)`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriterLimits {
    pub streams: usize,
    pub packets: usize,
    pub imports: usize,
    pub host_groups: usize,
    pub hosts_per_group: usize,
}

impl Default for WriterLimits {
    fn default() -> Self {
        WriterLimits {
            streams: u32::MAX as usize,
            packets: u32::MAX as usize,
            imports: u32::MAX as usize,
            host_groups: MAX_HOST_GROUPS,
            hosts_per_group: MAX_HOSTS_PER_GROUP,
        }
    }
}

struct HostGroup {
    v6: bool,
    hosts: Vec<IpAddr>,
    positions: HashMap<IpAddr, u16>,
}

impl HostGroup {
    fn new(v6: bool) -> Self {
        HostGroup {
            v6,
            hosts: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn missing(&self, client: IpAddr, server: IpAddr) -> usize {
        let client_missing = !self.positions.contains_key(&client);
        let server_missing = client != server && !self.positions.contains_key(&server);
        client_missing as usize + server_missing as usize
    }

    fn add(&mut self, host: IpAddr) -> u16 {
        if let Some(&position) = self.positions.get(&host) {
            return position;
        }
        let position = self.hosts.len() as u16;
        self.hosts.push(host);
        self.positions.insert(host, position);
        position
    }

    fn truncate(&mut self, len: usize) {
        if len >= self.hosts.len() {
            return;
        }
        for host in self.hosts.drain(len..) {
            self.positions.remove(&host);
        }
    }
}

struct BufferedStream {
    record: StreamRecord,
    // Absolute times; converted to offsets from the file's reference time on finalize.
    first_ns: i128,
    last_ns: i128,
}

struct PendingStream<'a> {
    id: u64,
    first_ns: i128,
    last_ns: i128,
    host_group: u16,
    client_host: u16,
    server_host: u16,
    client_port: u16,
    server_port: u16,
    flags: u16,
    client_bytes: u64,
    server_bytes: u64,
    packets: Vec<PacketRecord>,
    data: &'a [u8],
}

struct Checkpoint {
    streams: usize,
    packets: usize,
    imports: usize,
    host_groups: Vec<usize>,
    data_len: u64,
}

/// Writes one immutable index file.
///
/// Payload bytes are streamed to the file as streams are added; packets, hosts, imports and
/// stream records stay in memory until [`IndexWriter::finalize`].
pub struct IndexWriter {
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
    flushed: u64,
    limits: WriterLimits,
    host_groups: Vec<HostGroup>,
    imports: Vec<(String, u64)>,
    import_ids: HashMap<(String, u64), u32>,
    packets: Vec<PacketRecord>,
    streams: Vec<BufferedStream>,
    stream_ids: HashSet<u64>,
}

pub(crate) fn epoch_nanos(timestamp: DateTime<Utc>) -> i128 {
    timestamp.timestamp() as i128 * NANOS_PER_SECOND + timestamp.timestamp_subsec_nanos() as i128
}

/// Chunk-size sequence followed by the client bytes and the server bytes.
pub(crate) fn encode_stream_data(stream: &StreamInput) -> Vec<u8> {
    let mut runs: Vec<(Direction, u64)> = Vec::new();
    let mut content: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
    for chunk in &stream.chunks {
        if chunk.bytes.is_empty() {
            continue;
        }
        let Some(packet) = stream.packets.get(chunk.packet) else {
            continue;
        };
        content[packet.direction.index()].extend_from_slice(&chunk.bytes);
        match runs.last_mut() {
            Some((direction, size)) if *direction == packet.direction => {
                *size += chunk.bytes.len() as u64
            }
            _ => runs.push((packet.direction, chunk.bytes.len() as u64)),
        }
    }

    let mut out = Vec::new();
    let mut expected = Direction::ClientToServer;
    for (direction, size) in runs {
        if direction != expected {
            VByteEncoder::encode_u64(&mut out, 0);
        }
        VByteEncoder::encode_u64(&mut out, size);
        expected = direction.reverse();
    }
    VByteEncoder::encode_u64(&mut out, 0);
    VByteEncoder::encode_u64(&mut out, 0);
    let [client, server] = content;
    out.extend_from_slice(&client);
    out.extend_from_slice(&server);
    out
}

/// Skip count of every descriptor: the payload-less descriptors that can be jumped over before
/// the next descriptor with data, or before the final descriptor.
fn assign_skips(packets: &mut [PacketRecord]) {
    let Some(last) = packets.len().checked_sub(1) else {
        return;
    };
    let mut target = last;
    for j in (0..packets.len()).rev() {
        let skip = target.saturating_sub(j + 1);
        packets[j].skip = skip.min(MAX_SKIP) as u8;
        if packets[j].data_size != 0 {
            target = j;
        }
    }
}

/// Stream positions sorted by `compare`; ties keep insertion order.
fn lookup_bytes(count: usize, compare: impl Fn(usize, usize) -> Ordering) -> Vec<u8> {
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by(|&a, &b| compare(a, b));
    order.iter().flat_map(|&i| (i as u32).to_le_bytes()).collect()
}

impl IndexWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_limits(path, WriterLimits::default())
    }

    /// Writer for a fresh `{uuid}.idx` file in `layout`.
    pub fn create(layout: &IndexLayout) -> Result<Self> {
        Self::new(layout.new_index_path())
    }

    pub(crate) fn with_limits(path: impl AsRef<Path>, limits: WriterLimits) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)?;
        // Header placeholder, rewritten by finalize
        file.write_all(&[0u8; HEADER_SIZE])?;

        Ok(IndexWriter {
            path,
            file,
            buffer: Vec::with_capacity(FLUSH_THRESHOLD),
            flushed: 0,
            limits,
            host_groups: Vec::new(),
            imports: Vec::new(),
            import_ids: HashMap::new(),
            packets: Vec::new(),
            streams: Vec::new(),
            stream_ids: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn contains_stream(&self, id: StreamId) -> bool {
        self.stream_ids.contains(&id.0)
    }

    /// Reference time the file would get if finalized now.
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        let secs = self.reference_secs()?;
        DateTime::from_timestamp(secs as i64, 0)
    }

    fn reference_secs(&self) -> Option<u64> {
        self.streams
            .iter()
            .map(|s| s.first_ns.div_euclid(NANOS_PER_SECOND))
            .min()
            .map(|secs| secs.max(0) as u64)
    }

    /// Adds a stream under `id`.
    ///
    /// Returns `Ok(false)` without changing the writer when the file cannot take the stream;
    /// the caller should continue with a new writer.
    pub fn add_stream(&mut self, stream: &StreamInput, id: StreamId) -> Result<bool> {
        self.validate(stream, id)?;
        let checkpoint = self.checkpoint();
        match self.try_add_stream(stream, id) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.rollback(checkpoint)?;
                debug!(path = %self.path.display(), stream = id.0, "index full, stream rejected");
                Ok(false)
            }
            Err(err) => {
                self.rollback(checkpoint)?;
                Err(err)
            }
        }
    }

    fn validate(&self, stream: &StreamInput, id: StreamId) -> Result<()> {
        if self.stream_ids.contains(&id.0) {
            return Err(Error::invalid_input(format!("stream {} added twice", id)));
        }
        let Some(first) = stream.packets.first() else {
            return Err(Error::invalid_input(format!("stream {} has no packets", id)));
        };
        if first.timestamp.timestamp() < 0 {
            return Err(Error::invalid_input(format!(
                "stream {} starts before the epoch",
                id
            )));
        }
        if stream.client.is_ipv4() != stream.server.is_ipv4() {
            return Err(Error::invalid_input(format!(
                "stream {} mixes address families ({} and {})",
                id, stream.client, stream.server
            )));
        }
        let mut previous = 0;
        for chunk in &stream.chunks {
            if chunk.packet >= stream.packets.len() {
                return Err(Error::invalid_input(format!(
                    "stream {}: chunk references packet {} of {}",
                    id,
                    chunk.packet,
                    stream.packets.len()
                )));
            }
            if chunk.packet < previous {
                return Err(Error::invalid_input(format!(
                    "stream {}: chunks are not ordered by packet",
                    id
                )));
            }
            previous = chunk.packet;
        }
        Ok(())
    }

    fn try_add_stream(&mut self, stream: &StreamInput, id: StreamId) -> Result<bool> {
        if self.streams.len() >= self.limits.streams {
            return Ok(false);
        }
        let Some((host_group, client_host, server_host)) =
            self.add_hosts(stream.client.ip(), stream.server.ip())
        else {
            return Ok(false);
        };

        let mut payload = vec![0usize; stream.packets.len()];
        for chunk in &stream.chunks {
            payload[chunk.packet] += chunk.bytes.len();
        }

        let first = stream.packets[0].timestamp;
        let mut packets = Vec::with_capacity(stream.packets.len());
        for (position, packet) in stream.packets.iter().enumerate() {
            let offset = packet.source.index & IMPORT_OFFSET_MASK;
            let Some(import_id) = self.import_id(&packet.source.filename, offset) else {
                return Ok(false);
            };
            let rel_time_us = (packet.timestamp - first)
                .num_microseconds()
                .unwrap_or(i64::MAX)
                .max(0) as u32;
            let mut flags = PACKET_FLAG_HAS_NEXT;
            if packet.direction == Direction::ServerToClient {
                flags |= PACKET_FLAG_SERVER_TO_CLIENT;
            }
            let mut remaining = payload[position];
            loop {
                let size = remaining.min(MAX_PACKET_DATA);
                packets.push(PacketRecord {
                    rel_time_us,
                    import_id,
                    packet_index: packet.source.index as u32,
                    data_size: size as u16,
                    skip: 0,
                    flags,
                });
                remaining -= size;
                if remaining == 0 {
                    break;
                }
            }
        }
        if let Some(last) = packets.last_mut() {
            last.flags &= !PACKET_FLAG_HAS_NEXT;
        }
        assign_skips(&mut packets);
        if self.packets.len() + packets.len() > self.limits.packets {
            return Ok(false);
        }

        let first_ns = epoch_nanos(first);
        let last_ns = stream
            .packets
            .last()
            .map_or(first_ns, |p| epoch_nanos(p.timestamp))
            .max(first_ns);
        let data = encode_stream_data(stream);
        self.commit(PendingStream {
            id: id.0,
            first_ns,
            last_ns,
            host_group,
            client_host,
            server_host,
            client_port: stream.client.port(),
            server_port: stream.server.port(),
            flags: stream.protocol.flags(),
            client_bytes: stream.bytes(Direction::ClientToServer),
            server_bytes: stream.bytes(Direction::ServerToClient),
            packets,
            data: &data,
        })?;
        Ok(true)
    }

    /// Copies every stream of `reader` not yet present in this writer.
    ///
    /// All or nothing: on `Ok(false)` (capacity) or an error, the writer is left as before.
    pub fn add_index(&mut self, reader: &IndexReader) -> Result<bool> {
        self.add_index_excluding(reader, &HashSet::new())
    }

    /// Like [`IndexWriter::add_index`], skipping the stream ids in `exclude`.
    pub(crate) fn add_index_excluding(
        &mut self,
        reader: &IndexReader,
        exclude: &HashSet<u64>,
    ) -> Result<bool> {
        let checkpoint = self.checkpoint();
        match self.try_add_index(reader, exclude) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.rollback(checkpoint)?;
                debug!(
                    path = %self.path.display(),
                    source = %reader.path().display(),
                    "index full, source index rejected"
                );
                Ok(false)
            }
            Err(err) => {
                self.rollback(checkpoint)?;
                Err(err)
            }
        }
    }

    fn try_add_index(&mut self, reader: &IndexReader, exclude: &HashSet<u64>) -> Result<bool> {
        let reference_ns = reader.reference_secs() as i128 * NANOS_PER_SECOND;
        let mut import_remap: Vec<Option<u32>> = vec![None; reader.import_count()];
        for stream in reader.streams() {
            let stream = stream?;
            let record = *stream.record();
            if self.stream_ids.contains(&record.stream_id) || exclude.contains(&record.stream_id) {
                continue;
            }
            if self.streams.len() >= self.limits.streams {
                return Ok(false);
            }
            let Some((host_group, client_host, server_host)) =
                self.add_hosts(stream.client_host(), stream.server_host())
            else {
                return Ok(false);
            };

            let mut packets = stream.packet_records()?;
            if self.packets.len() + packets.len() > self.limits.packets {
                return Ok(false);
            }
            for packet in &mut packets {
                let slot = import_remap
                    .get_mut(packet.import_id as usize)
                    .ok_or_else(|| {
                        Error::corrupt(format!("packet references import {}", packet.import_id))
                    })?;
                packet.import_id = match *slot {
                    Some(id) => id,
                    None => {
                        let import = reader.import(packet.import_id)?;
                        let Some(id) = self.import_id(&import.filename, import.packet_index_offset)
                        else {
                            return Ok(false);
                        };
                        *slot = Some(id);
                        id
                    }
                };
            }

            self.commit(PendingStream {
                id: record.stream_id,
                first_ns: reference_ns + record.first_packet_time_ns as i128,
                last_ns: reference_ns + record.last_packet_time_ns as i128,
                host_group,
                client_host,
                server_host,
                client_port: record.client_port,
                server_port: record.server_port,
                flags: record.flags,
                client_bytes: record.client_bytes,
                server_bytes: record.server_bytes,
                packets,
                data: stream.data_blob()?,
            })?;
        }
        Ok(true)
    }

    fn add_hosts(&mut self, client: IpAddr, server: IpAddr) -> Option<(u16, u16, u16)> {
        let v6 = client.is_ipv6();
        let limit = self.limits.hosts_per_group;
        let index = match self
            .host_groups
            .iter()
            .position(|g| g.v6 == v6 && g.hosts.len() + g.missing(client, server) <= limit)
        {
            Some(index) => index,
            None => {
                if self.host_groups.len() >= self.limits.host_groups {
                    return None;
                }
                self.host_groups.push(HostGroup::new(v6));
                self.host_groups.len() - 1
            }
        };
        let group = &mut self.host_groups[index];
        Some((index as u16, group.add(client), group.add(server)))
    }

    fn import_id(&mut self, filename: &str, offset: u64) -> Option<u32> {
        let key = (filename.to_string(), offset);
        if let Some(&id) = self.import_ids.get(&key) {
            return Some(id);
        }
        if self.imports.len() >= self.limits.imports {
            return None;
        }
        let id = self.imports.len() as u32;
        self.imports.push(key.clone());
        self.import_ids.insert(key, id);
        Some(id)
    }

    fn commit(&mut self, stream: PendingStream<'_>) -> Result<()> {
        let data_start = self.data_len();
        self.write_data(stream.data)?;
        let packet_info_start = self.packets.len() as u32;
        self.packets.extend(stream.packets);
        self.stream_ids.insert(stream.id);
        self.streams.push(BufferedStream {
            record: StreamRecord {
                stream_id: stream.id,
                first_packet_time_ns: 0,
                last_packet_time_ns: 0,
                data_start,
                client_bytes: stream.client_bytes,
                server_bytes: stream.server_bytes,
                packet_info_start,
                flags: stream.flags,
                host_group: stream.host_group,
                client_host: stream.client_host,
                server_host: stream.server_host,
                client_port: stream.client_port,
                server_port: stream.server_port,
            },
            first_ns: stream.first_ns,
            last_ns: stream.last_ns,
        });
        Ok(())
    }

    fn data_len(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.flushed += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            streams: self.streams.len(),
            packets: self.packets.len(),
            imports: self.imports.len(),
            host_groups: self.host_groups.iter().map(|g| g.hosts.len()).collect(),
            data_len: self.data_len(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) -> Result<()> {
        for stream in self.streams.drain(checkpoint.streams..) {
            self.stream_ids.remove(&stream.record.stream_id);
        }
        self.packets.truncate(checkpoint.packets);
        for key in self.imports.drain(checkpoint.imports..) {
            self.import_ids.remove(&key);
        }
        self.host_groups.truncate(checkpoint.host_groups.len());
        for (group, len) in self.host_groups.iter_mut().zip(checkpoint.host_groups) {
            group.truncate(len);
        }

        if checkpoint.data_len >= self.flushed {
            self.buffer
                .truncate((checkpoint.data_len - self.flushed) as usize);
        } else {
            self.buffer.clear();
            let end = HEADER_SIZE as u64 + checkpoint.data_len;
            self.file.set_len(end)?;
            self.file.seek(SeekFrom::Start(end))?;
            self.flushed = checkpoint.data_len;
        }
        Ok(())
    }

    /// Closes the writer and removes its partial file.
    pub fn discard(self) -> Result<()> {
        let IndexWriter { path, file, .. } = self;
        drop(file);
        fs::remove_file(&path)?;
        Ok(())
    }

    /// Writes all remaining sections and the header, then opens the file for reading.
    ///
    /// The partial file is removed if writing fails.
    pub fn finalize(mut self) -> Result<IndexReader> {
        if let Err(err) = self.write_sections() {
            let IndexWriter { path, file, .. } = self;
            drop(file);
            if let Err(remove_err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %remove_err, "failed to remove partial index");
            }
            return Err(err);
        }
        debug!(
            path = %self.path.display(),
            streams = self.streams.len(),
            packets = self.packets.len(),
            host_groups = self.host_groups.len(),
            "finalized index"
        );
        IndexReader::open(&self.path)
    }

    fn write_section(
        &mut self,
        header: &mut FileHeader,
        position: &mut u64,
        section: Section,
        bytes: &[u8],
    ) -> Result<()> {
        let begin = *position;
        self.file.write_all(bytes)?;
        let end = begin + bytes.len() as u64;
        header.sections[section.index()] = SectionRange { begin, end };
        let padding = format::padding(end);
        self.file.write_all(&vec![0u8; padding as usize])?;
        *position = end + padding;
        Ok(())
    }

    fn write_sections(&mut self) -> Result<()> {
        self.flush()?;
        let reference_secs = self.reference_secs().unwrap_or(0);
        let reference_ns = reference_secs as i128 * NANOS_PER_SECOND;
        let mut header = FileHeader {
            first_packet_time: reference_secs,
            ..FileHeader::default()
        };

        // data section already sits behind the header
        let data_end = HEADER_SIZE as u64 + self.flushed;
        header.sections[Section::Data.index()] = SectionRange {
            begin: HEADER_SIZE as u64,
            end: data_end,
        };
        let padding = format::padding(data_end);
        self.file.write_all(&vec![0u8; padding as usize])?;
        let mut position = data_end + padding;

        let (filenames, imports) = {
            let mut filenames = Vec::new();
            let mut filename_offsets: HashMap<&str, u64> = HashMap::new();
            let mut imports = Vec::with_capacity(self.imports.len() * ImportRecord::SIZE);
            for (filename, offset) in &self.imports {
                let filename_offset =
                    *filename_offsets.entry(filename.as_str()).or_insert_with(|| {
                        let start = filenames.len() as u64;
                        filenames.extend_from_slice(filename.as_bytes());
                        filenames.push(0);
                        start
                    });
                ImportRecord {
                    filename_offset,
                    packet_index_offset: *offset,
                }
                .encode(&mut imports);
            }
            (filenames, imports)
        };
        self.write_section(&mut header, &mut position, Section::ImportFilenames, &filenames)?;
        self.write_section(&mut header, &mut position, Section::Imports, &imports)?;

        let mut packets = Vec::with_capacity(self.packets.len() * PacketRecord::SIZE);
        for packet in &self.packets {
            packet.encode(&mut packets);
        }
        self.write_section(&mut header, &mut position, Section::Packets, &packets)?;
        drop(packets);

        let (mut v4_hosts, mut v6_hosts) = (Vec::new(), Vec::new());
        let (mut v4_count, mut v6_count) = (0u32, 0u32);
        let mut groups = Vec::with_capacity(self.host_groups.len() * HostGroupRecord::SIZE);
        for group in &self.host_groups {
            let (blob, count) = if group.v6 {
                (&mut v6_hosts, &mut v6_count)
            } else {
                (&mut v4_hosts, &mut v4_count)
            };
            HostGroupRecord {
                start: *count,
                count: group.hosts.len().saturating_sub(1) as u16,
                flags: if group.v6 { HOST_GROUP_FLAG_V6 } else { 0 },
            }
            .encode(&mut groups);
            for host in &group.hosts {
                match host {
                    IpAddr::V4(ip) => blob.extend_from_slice(&ip.octets()),
                    IpAddr::V6(ip) => blob.extend_from_slice(&ip.octets()),
                }
            }
            *count += group.hosts.len() as u32;
        }
        self.write_section(&mut header, &mut position, Section::V4Hosts, &v4_hosts)?;
        self.write_section(&mut header, &mut position, Section::V6Hosts, &v6_hosts)?;
        self.write_section(&mut header, &mut position, Section::HostGroups, &groups)?;

        let mut streams = Vec::with_capacity(self.streams.len() * StreamRecord::SIZE);
        for stream in &self.streams {
            StreamRecord {
                first_packet_time_ns: (stream.first_ns - reference_ns) as u64,
                last_packet_time_ns: (stream.last_ns - reference_ns) as u64,
                ..stream.record
            }
            .encode(&mut streams);
        }
        self.write_section(&mut header, &mut position, Section::Streams, &streams)?;

        let lookups = {
            let streams = &self.streams;
            let first_sources: Vec<(&str, u64)> = streams
                .iter()
                .map(|s| {
                    let packet = self.packets[s.record.packet_info_start as usize];
                    let (filename, offset) = &self.imports[packet.import_id as usize];
                    (filename.as_str(), offset + packet.packet_index as u64)
                })
                .collect();
            [
                (
                    Section::ByStreamId,
                    lookup_bytes(streams.len(), |a, b| {
                        streams[a].record.stream_id.cmp(&streams[b].record.stream_id)
                    }),
                ),
                (
                    Section::ByFirstPacketSource,
                    lookup_bytes(streams.len(), |a, b| first_sources[a].cmp(&first_sources[b])),
                ),
                (
                    Section::ByFirstPacketTime,
                    lookup_bytes(streams.len(), |a, b| streams[a].first_ns.cmp(&streams[b].first_ns)),
                ),
                (
                    Section::ByLastPacketTime,
                    lookup_bytes(streams.len(), |a, b| streams[a].last_ns.cmp(&streams[b].last_ns)),
                ),
            ]
        };
        for (section, bytes) in lookups {
            self.write_section(&mut header, &mut position, section, &bytes)?;
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Protocol;
    use crate::storage::input::PacketSource;
    use chrono::{Duration, TimeZone};

    fn source(index: u64) -> PacketSource {
        PacketSource {
            filename: "capture.pcap".to_string(),
            index,
        }
    }

    fn simple_stream(start: DateTime<Utc>, client: &str, server: &str) -> StreamInput {
        let mut stream = StreamInput::new(
            client.parse().unwrap(),
            server.parse().unwrap(),
            Protocol::Tcp,
        );
        stream
            .push_packet(start, Direction::ClientToServer, source(0), b"")
            .push_packet(start + Duration::milliseconds(1), Direction::ClientToServer, source(1), b"GET")
            .push_packet(start + Duration::milliseconds(2), Direction::ServerToClient, source(2), b"OK");
        stream
    }

    #[test]
    fn chunk_sizes_start_with_client() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let stream = simple_stream(start, "10.0.0.1:1000", "10.0.0.2:80");
        assert_eq!(encode_stream_data(&stream), b"\x03\x02\x00\x00GETOK".to_vec());

        let mut reply_first = StreamInput::new(stream.client, stream.server, Protocol::Tcp);
        reply_first.push_packet(start, Direction::ServerToClient, source(0), b"hi");
        assert_eq!(encode_stream_data(&reply_first), b"\x00\x02\x00\x00hi".to_vec());

        let empty = StreamInput::new(stream.client, stream.server, Protocol::Tcp);
        assert_eq!(encode_stream_data(&empty), vec![0, 0]);
    }

    #[test]
    fn skips_point_at_next_payload() {
        let mut packets: Vec<PacketRecord> = [0u16, 0, 0, 5, 0, 0]
            .iter()
            .map(|&data_size| PacketRecord {
                data_size,
                ..PacketRecord::default()
            })
            .collect();
        assign_skips(&mut packets);
        let skips: Vec<u8> = packets.iter().map(|p| p.skip).collect();
        assert_eq!(skips, vec![2, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn rejects_malformed_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = IndexWriter::new(dir.path().join("a.idx")).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let no_packets = StreamInput::new(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
            Protocol::Udp,
        );
        assert!(writer.add_stream(&no_packets, StreamId(1)).is_err());

        let mixed = simple_stream(start, "10.0.0.1:1000", "[::1]:80");
        assert!(writer.add_stream(&mixed, StreamId(1)).is_err());

        let good = simple_stream(start, "10.0.0.1:1000", "10.0.0.2:80");
        assert!(writer.add_stream(&good, StreamId(1)).unwrap());
        let err = writer.add_stream(&good, StreamId(1)).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::InvalidInput);
        writer.discard().unwrap();
    }

    #[test]
    fn overflow_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let limits = WriterLimits {
            host_groups: 1,
            hosts_per_group: 3,
            ..WriterLimits::default()
        };
        let mut writer = IndexWriter::with_limits(dir.path().join("a.idx"), limits).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let first = simple_stream(start, "10.0.0.1:1000", "10.0.0.2:80");
        assert!(writer.add_stream(&first, StreamId(1)).unwrap());
        let data_len = writer.data_len();
        let imports = writer.imports.len();

        // needs two new hosts, only one slot left
        let second = simple_stream(start, "10.0.0.3:1000", "10.0.0.4:80");
        assert!(!writer.add_stream(&second, StreamId(2)).unwrap());
        assert_eq!(writer.stream_count(), 1);
        assert_eq!(writer.host_groups[0].hosts.len(), 2);
        assert_eq!(writer.data_len(), data_len);
        assert_eq!(writer.imports.len(), imports);

        // a stream reusing a known host still fits
        let third = simple_stream(start, "10.0.0.1:1001", "10.0.0.5:80");
        assert!(writer.add_stream(&third, StreamId(3)).unwrap());

        let reader = writer.finalize().unwrap();
        assert_eq!(reader.stream_count(), 2);
        assert!(reader.stream_by_id(StreamId(2)).unwrap().is_none());
    }
}
