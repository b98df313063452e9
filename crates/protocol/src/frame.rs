//! Frame codec and packet factory.
//!
//! A frame is a 1-byte packet tag, a 4-byte little-endian body length and the
//! body. Once a header has been read the body is read in full or the
//! connection is considered corrupt; nothing is retried.

use std::collections::HashMap;
use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::packets::{
    BuildCommand, BuildResult, Cancel, ConsoleWrite, LogMessage, NodePacket, Packet, PacketType,
    TaskCommand, TaskComplete,
};
use crate::wire::WireError;

pub const HEADER_LEN: usize = 5;
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("connection closed inside a frame header ({received} of 5 bytes)")]
    TruncatedHeader { received: usize },
    #[error("connection closed inside a {packet_type:?} body ({received} of {expected} bytes)")]
    TruncatedBody {
        packet_type: PacketType,
        expected: usize,
        received: usize,
    },
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: usize, max: usize },
    #[error("unknown packet tag {0:#04x}")]
    UnknownTag(u8),
    #[error("no deserializer registered for {0:?}")]
    Unregistered(PacketType),
    #[error("failed to decode {packet_type:?}: {source}")]
    Decode {
        packet_type: PacketType,
        #[source]
        source: WireError,
    },
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Clean disconnect, as opposed to corruption or I/O failure.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }
}

type Deserializer = fn(&[u8]) -> Result<Packet, WireError>;

fn decode_as<P>(body: &[u8]) -> Result<Packet, WireError>
where
    P: NodePacket + Into<Packet>,
{
    P::decode(body).map(Into::into)
}

/// Maps packet tags to deserializers. A conversation only registers the
/// packets its peer is allowed to send; anything else is fatal.
#[derive(Clone, Default)]
pub struct PacketFactory {
    deserializers: HashMap<PacketType, Deserializer>,
}

impl PacketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(&mut self) -> &mut Self
    where
        P: NodePacket + Into<Packet>,
    {
        self.deserializers.insert(P::TYPE, decode_as::<P>);
        self
    }

    pub fn unregister(&mut self, packet_type: PacketType) {
        self.deserializers.remove(&packet_type);
    }

    pub fn is_registered(&self, packet_type: PacketType) -> bool {
        self.deserializers.contains_key(&packet_type)
    }

    pub fn deserialize(&self, packet_type: PacketType, body: &[u8]) -> Result<Packet, FrameError> {
        let deserializer = self
            .deserializers
            .get(&packet_type)
            .ok_or(FrameError::Unregistered(packet_type))?;
        deserializer(body).map_err(|source| FrameError::Decode {
            packet_type,
            source,
        })
    }

    /// Packets a server node accepts from a client.
    pub fn for_server() -> Self {
        let mut factory = Self::new();
        factory.register::<BuildCommand>().register::<Cancel>();
        factory
    }

    /// Packets a client accepts from a server node.
    pub fn for_client() -> Self {
        let mut factory = Self::new();
        factory
            .register::<ConsoleWrite>()
            .register::<BuildResult>();
        factory
    }

    /// Packets a task host accepts from its launcher.
    pub fn for_task_host() -> Self {
        let mut factory = Self::new();
        factory.register::<TaskCommand>().register::<Cancel>();
        factory
    }

    /// Packets a task launcher accepts from a task host.
    pub fn for_task_launcher() -> Self {
        let mut factory = Self::new();
        factory
            .register::<LogMessage>()
            .register::<TaskComplete>();
        factory
    }
}

impl std::fmt::Debug for PacketFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.deserializers.keys()).finish()
    }
}

/// Serialize `packet` as one frame, back-patching the body length.
pub fn encode_frame(packet: &Packet, buf: &mut BytesMut) -> Result<(), FrameError> {
    let start = buf.len();
    buf.put_u8(packet.packet_type().tag());
    buf.put_u32_le(0);
    packet.write_body(buf);

    let body_len = buf.len() - start - HEADER_LEN;
    if body_len > DEFAULT_MAX_BODY_LEN {
        buf.truncate(start);
        return Err(FrameError::BodyTooLarge {
            len: body_len,
            max: DEFAULT_MAX_BODY_LEN,
        });
    }
    buf[start + 1..start + HEADER_LEN].copy_from_slice(&(body_len as u32).to_le_bytes());
    Ok(())
}

/// Write one frame in a single `write_all` and flush.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode_frame(packet, &mut buf)?;
    trace!(packet = ?packet.packet_type(), len = buf.len() - HEADER_LEN, "writing frame");
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads frames off one connection, reusing its body buffer.
pub struct FrameReader<R> {
    reader: R,
    body: Vec<u8>,
    max_body_len: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, DEFAULT_MAX_BODY_LEN)
    }

    pub fn with_limit(reader: R, max_body_len: usize) -> Self {
        Self {
            reader,
            body: Vec::new(),
            max_body_len,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub async fn read_frame(&mut self, factory: &PacketFactory) -> Result<Packet, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        let received = read_full(&mut self.reader, &mut header).await?;
        if received == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if received < HEADER_LEN {
            return Err(FrameError::TruncatedHeader { received });
        }

        let packet_type = PacketType::from_tag(header[0]).ok_or(FrameError::UnknownTag(header[0]))?;
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > self.max_body_len {
            return Err(FrameError::BodyTooLarge {
                len,
                max: self.max_body_len,
            });
        }
        trace!(packet = ?packet_type, len, "read frame header");

        self.body.clear();
        self.body.resize(len, 0);
        let received = read_full(&mut self.reader, &mut self.body).await?;
        if received < len {
            return Err(FrameError::TruncatedBody {
                packet_type,
                expected: len,
                received,
            });
        }

        factory.deserialize(packet_type, &self.body)
    }
}

/// Fill `buf` unless EOF comes first; returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::duplex;

    fn sample_packets() -> Vec<Packet> {
        let mut env = BTreeMap::new();
        env.insert("X".to_string(), "1".to_string());
        vec![
            BuildCommand {
                command_line: "build.proj".into(),
                startup_directory: "/work".into(),
                environment: env,
                culture: "en-US".into(),
                ui_culture: "en-US".into(),
            }
            .into(),
            ConsoleWrite::stdout("Building...\n").into(),
            ConsoleWrite::stderr("").into(),
            BuildResult::new(0, buildhost_common::ExitType::Success).into(),
            Cancel.into(),
        ]
    }

    fn all_packets() -> PacketFactory {
        let mut factory = PacketFactory::for_server();
        factory
            .register::<ConsoleWrite>()
            .register::<BuildResult>();
        factory
    }

    #[test]
    fn header_carries_tag_and_le_length() {
        let mut buf = BytesMut::new();
        encode_frame(&BuildResult::new(3, buildhost_common::ExitType::BuildError).into(), &mut buf)
            .unwrap();
        assert_eq!(buf[0], PacketType::BuildResult.tag());
        let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len, buf.len() - HEADER_LEN);
    }

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let (mut tx, rx) = duplex(64 * 1024);
        let packets = sample_packets();
        let to_send = packets.clone();
        let writer = tokio::spawn(async move {
            for packet in &to_send {
                write_frame(&mut tx, packet).await.unwrap();
            }
        });

        let factory = all_packets();
        let mut reader = FrameReader::new(rx);
        for expected in &packets {
            assert_eq!(&reader.read_frame(&factory).await.unwrap(), expected);
        }
        writer.await.unwrap();
        assert!(reader.read_frame(&factory).await.unwrap_err().is_peer_closed());
    }

    #[tokio::test]
    async fn multi_megabyte_console_text_survives() {
        let (mut tx, rx) = duplex(1024 * 1024);
        let text = "line of build output\n".repeat(200_000);
        let packet: Packet = ConsoleWrite::stdout(text.clone()).into();
        let sent = packet.clone();
        tokio::spawn(async move { write_frame(&mut tx, &sent).await.unwrap() });
        let mut reader = FrameReader::new(rx);
        let got = reader.read_frame(&PacketFactory::for_client()).await.unwrap();
        assert_eq!(got, packet);
    }

    #[tokio::test]
    async fn partial_header_and_body_are_distinct_from_clean_close() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(&[PacketType::Cancel.tag(), 0, 0]).await.unwrap();
        drop(tx);
        let err = FrameReader::new(rx)
            .read_frame(&PacketFactory::for_server())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { received: 3 }));

        let (mut tx, rx) = duplex(1024);
        tx.write_all(&[PacketType::BuildResult.tag(), 10, 0, 0, 0, 1, 2])
            .await
            .unwrap();
        drop(tx);
        let err = FrameReader::new(rx)
            .read_frame(&PacketFactory::for_client())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedBody {
                expected: 10,
                received: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unregistered_and_unknown_tags_are_fatal() {
        let (mut tx, rx) = duplex(1024);
        write_frame(&mut tx, &ConsoleWrite::stdout("hi").into()).await.unwrap();
        let err = FrameReader::new(rx)
            .read_frame(&PacketFactory::for_server())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Unregistered(PacketType::ConsoleWrite)));

        let (mut tx, rx) = duplex(1024);
        tx.write_all(&[0x42, 0, 0, 0, 0]).await.unwrap();
        let err = FrameReader::new(rx)
            .read_frame(&PacketFactory::for_server())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::UnknownTag(0x42)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_body() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(&[PacketType::ConsoleWrite.tag(), 0, 0, 1, 0])
            .await
            .unwrap();
        let err = FrameReader::with_limit(rx, 1024)
            .read_frame(&PacketFactory::for_client())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::BodyTooLarge {
                len: 65536,
                max: 1024
            }
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let (mut tx, rx) = duplex(1024);
        // BuildResult needs at least 5 bytes.
        tx.write_all(&[PacketType::BuildResult.tag(), 2, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = FrameReader::new(rx)
            .read_frame(&PacketFactory::for_client())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::Decode {
                packet_type: PacketType::BuildResult,
                ..
            }
        ));
    }
}
