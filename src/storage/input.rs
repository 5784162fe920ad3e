use std::net::SocketAddr;
use chrono::{DateTime, Utc};
use crate::core::types::{Direction, Protocol};

/// Where a packet was originally read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketSource {
    pub filename: String,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInput {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub source: PacketSource,
}

/// Payload bytes carried by the packet at position `packet` of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub packet: usize,
    pub bytes: Vec<u8>,
}

/// A reassembled stream as handed over by the capture pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInput {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: Protocol,
    pub packets: Vec<PacketInput>,
    /// Ordered by packet position.
    pub chunks: Vec<StreamChunk>,
}

impl StreamInput {
    pub fn new(client: SocketAddr, server: SocketAddr, protocol: Protocol) -> Self {
        StreamInput {
            client,
            server,
            protocol,
            packets: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Appends a packet and, if `payload` is not empty, the chunk it carries.
    pub fn push_packet(
        &mut self,
        timestamp: DateTime<Utc>,
        direction: Direction,
        source: PacketSource,
        payload: &[u8],
    ) -> &mut Self {
        if !payload.is_empty() {
            self.chunks.push(StreamChunk {
                packet: self.packets.len(),
                bytes: payload.to_vec(),
            });
        }
        self.packets.push(PacketInput {
            timestamp,
            direction,
            source,
        });
        self
    }

    pub fn bytes(&self, direction: Direction) -> u64 {
        self.chunks
            .iter()
            .filter(|c| self.packets.get(c.packet).is_some_and(|p| p.direction == direction))
            .map(|c| c.bytes.len() as u64)
            .sum()
    }
}
