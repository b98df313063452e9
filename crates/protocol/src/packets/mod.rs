//! Closed set of node packets.
//!
//! Every packet type writes its fields in a fixed order and reads them back in
//! the same order. Bodies must be consumed exactly; leftover bytes mean the
//! peer speaks a different layout.

mod build;
mod task;

use bytes::BytesMut;

use crate::wire::{self, WireError};

pub use build::{BuildCommand, BuildResult, Cancel, ConsoleWrite};
pub use task::{
    LogEvent, LogImportance, LogKind, LogMessage, TaskCommand, TaskComplete, TaskResultKind,
};

/// One-byte frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    LogMessage = 0x08,
    TaskCommand = 0x09,
    TaskComplete = 0x0A,
    BuildCommand = 0xF0,
    BuildResult = 0xF1,
    ConsoleWrite = 0xF2,
    Cancel = 0xF3,
}

impl PacketType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x08 => Some(Self::LogMessage),
            0x09 => Some(Self::TaskCommand),
            0x0A => Some(Self::TaskComplete),
            0xF0 => Some(Self::BuildCommand),
            0xF1 => Some(Self::BuildResult),
            0xF2 => Some(Self::ConsoleWrite),
            0xF3 => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Serialization contract shared by all packet types.
pub trait NodePacket: Sized {
    const TYPE: PacketType;

    fn write_body(&self, buf: &mut BytesMut);

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError>;

    /// Decode a complete body, rejecting trailing bytes.
    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        let packet = Self::read_body(&mut body)?;
        wire::expect_end(body)?;
        Ok(packet)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    BuildCommand(BuildCommand),
    BuildResult(BuildResult),
    ConsoleWrite(ConsoleWrite),
    Cancel(Cancel),
    TaskCommand(TaskCommand),
    TaskComplete(TaskComplete),
    LogMessage(LogMessage),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::BuildCommand(_) => PacketType::BuildCommand,
            Packet::BuildResult(_) => PacketType::BuildResult,
            Packet::ConsoleWrite(_) => PacketType::ConsoleWrite,
            Packet::Cancel(_) => PacketType::Cancel,
            Packet::TaskCommand(_) => PacketType::TaskCommand,
            Packet::TaskComplete(_) => PacketType::TaskComplete,
            Packet::LogMessage(_) => PacketType::LogMessage,
        }
    }

    pub fn write_body(&self, buf: &mut BytesMut) {
        match self {
            Packet::BuildCommand(p) => p.write_body(buf),
            Packet::BuildResult(p) => p.write_body(buf),
            Packet::ConsoleWrite(p) => p.write_body(buf),
            Packet::Cancel(p) => p.write_body(buf),
            Packet::TaskCommand(p) => p.write_body(buf),
            Packet::TaskComplete(p) => p.write_body(buf),
            Packet::LogMessage(p) => p.write_body(buf),
        }
    }
}

macro_rules! packet_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Packet {
                fn from(packet: $variant) -> Self {
                    Packet::$variant(packet)
                }
            }
        )*
    };
}

packet_from!(
    BuildCommand,
    BuildResult,
    ConsoleWrite,
    Cancel,
    TaskCommand,
    TaskComplete,
    LogMessage,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for ty in [
            PacketType::LogMessage,
            PacketType::TaskCommand,
            PacketType::TaskComplete,
            PacketType::BuildCommand,
            PacketType::BuildResult,
            PacketType::ConsoleWrite,
            PacketType::Cancel,
        ] {
            assert_eq!(PacketType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(PacketType::from_tag(0x00), None);
        assert_eq!(PacketType::from_tag(0xFF), None);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut buf = BytesMut::new();
        Cancel.write_body(&mut buf);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(Cancel::decode(&buf), Err(WireError::TrailingBytes(2)));
    }
}
