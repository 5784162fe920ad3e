#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};

use streamdex::search::{ConverterAccess, ConverterData};
use streamdex::storage::{IndexReader, IndexWriter, PacketSource, StreamData, StreamInput};
use streamdex::{Direction, Protocol, Result, StreamId};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Builds a synthetic stream whose first packet is `id` seconds after [`start`].
pub struct StreamBuilder {
    id: u64,
    input: StreamInput,
    packets: i64,
}

pub fn stream(id: u64, client: &str, server: &str) -> StreamBuilder {
    StreamBuilder {
        id,
        input: StreamInput::new(client.parse().unwrap(), server.parse().unwrap(), Protocol::Tcp),
        packets: 0,
    }
}

impl StreamBuilder {
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.input.protocol = protocol;
        self
    }

    pub fn client(self, payload: &[u8]) -> Self {
        self.packet(Direction::ClientToServer, payload)
    }

    pub fn server(self, payload: &[u8]) -> Self {
        self.packet(Direction::ServerToClient, payload)
    }

    fn packet(mut self, direction: Direction, payload: &[u8]) -> Self {
        let time = start() + Duration::seconds(self.id as i64) + Duration::milliseconds(self.packets);
        self.input.push_packet(
            time,
            direction,
            PacketSource {
                filename: "capture.pcap".to_string(),
                index: self.id * 100 + self.packets as u64,
            },
            payload,
        );
        self.packets += 1;
        self
    }

    pub fn build(self) -> (StreamId, StreamInput) {
        let mut input = self.input;
        if input.packets.is_empty() {
            input.push_packet(
                start() + Duration::seconds(self.id as i64),
                Direction::ClientToServer,
                PacketSource {
                    filename: "capture.pcap".to_string(),
                    index: self.id * 100,
                },
                b"",
            );
        }
        (StreamId(self.id), input)
    }
}

pub fn write_index(path: impl AsRef<Path>, streams: Vec<StreamBuilder>) -> IndexReader {
    let mut writer = IndexWriter::new(path).unwrap();
    for builder in streams {
        let (id, input) = builder.build();
        assert!(writer.add_stream(&input, id).unwrap());
    }
    writer.finalize().unwrap()
}

pub fn ids(streams: &[streamdex::Stream<'_>]) -> Vec<u64> {
    streams.iter().map(|s| s.id().0).collect()
}

/// Converter with fixed client-side output per stream id. Streams without output count as not
/// converted yet.
#[derive(Default)]
pub struct FakeConverter {
    outputs: HashMap<u64, Vec<u8>>,
}

impl FakeConverter {
    pub fn with_output(mut self, id: u64, output: &[u8]) -> Self {
        self.outputs.insert(id, output.to_vec());
        self
    }
}

impl ConverterAccess for FakeConverter {
    fn data_for_search(&self, stream: StreamId) -> Result<ConverterData> {
        let Some(output) = self.outputs.get(&stream.0) else {
            return Ok(ConverterData::default());
        };
        let data = StreamData {
            data: [output.clone(), Vec::new()],
            chunk_offsets: vec![[0, 0], [output.len(), 0]],
        };
        Ok(ConverterData {
            data,
            client_bytes: output.len() as u64,
            server_bytes: 0,
            was_cached: true,
        })
    }
}
