use serde::{Serialize, Deserialize};
use std::fmt;

/// Process-lifetime unique stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        StreamId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        StreamId(id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];

    pub fn reverse(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    /// Position of this direction in per-direction `[T; 2]` arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Other,
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn flags(self) -> u16 {
        match self {
            Protocol::Other => 0b00,
            Protocol::Tcp => 0b01,
            Protocol::Udp => 0b10,
            Protocol::Sctp => 0b11,
        }
    }

    pub fn from_flags(flags: u16) -> Protocol {
        match flags & 0b11 {
            0b01 => Protocol::Tcp,
            0b10 => Protocol::Udp,
            0b11 => Protocol::Sctp,
            _ => Protocol::Other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Other => "Other",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}
