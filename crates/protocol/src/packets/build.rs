use std::collections::BTreeMap;

use buildhost_common::{ConsoleStream, ExitType};
use bytes::BytesMut;

use super::{NodePacket, PacketType};
use crate::wire::{self, WireError};

/// Client -> server: run one build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildCommand {
    pub command_line: String,
    pub startup_directory: String,
    pub environment: BTreeMap<String, String>,
    pub culture: String,
    pub ui_culture: String,
}

impl NodePacket for BuildCommand {
    const TYPE: PacketType = PacketType::BuildCommand;

    fn write_body(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.command_line);
        wire::put_string(buf, &self.startup_directory);
        wire::put_string_map(buf, &self.environment);
        wire::put_string(buf, &self.culture);
        wire::put_string(buf, &self.ui_culture);
    }

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            command_line: wire::get_string(buf)?,
            startup_directory: wire::get_string(buf)?,
            environment: wire::get_string_map(buf)?,
            culture: wire::get_string(buf)?,
            ui_culture: wire::get_string(buf)?,
        })
    }
}

/// Server -> client: a chunk of build console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleWrite {
    pub text: String,
    pub stream: ConsoleStream,
}

impl ConsoleWrite {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stream: ConsoleStream::Stdout,
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stream: ConsoleStream::Stderr,
        }
    }
}

impl NodePacket for ConsoleWrite {
    const TYPE: PacketType = PacketType::ConsoleWrite;

    fn write_body(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.text);
        wire::put_u8(buf, self.stream.as_byte());
    }

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError> {
        let text = wire::get_string(buf)?;
        let raw = wire::get_u8(buf)?;
        let stream = ConsoleStream::from_byte(raw).ok_or(WireError::InvalidValue {
            field: "console stream",
            value: i64::from(raw),
        })?;
        Ok(Self { text, stream })
    }
}

/// Server -> client: terminal packet of the build conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub exit_code: i32,
    pub exit_type: String,
}

impl BuildResult {
    pub fn new(exit_code: i32, exit_type: ExitType) -> Self {
        Self {
            exit_code,
            exit_type: exit_type.label().to_string(),
        }
    }

    pub fn exit_type(&self) -> ExitType {
        ExitType::from_label(&self.exit_type)
    }
}

impl NodePacket for BuildResult {
    const TYPE: PacketType = PacketType::BuildResult;

    fn write_body(&self, buf: &mut BytesMut) {
        wire::put_i32(buf, self.exit_code);
        wire::put_string(buf, &self.exit_type);
    }

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            exit_code: wire::get_i32(buf)?,
            exit_type: wire::get_string(buf)?,
        })
    }
}

/// Either direction's initiator -> worker: stop the in-flight work. No body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cancel;

impl NodePacket for Cancel {
    const TYPE: PacketType = PacketType::Cancel;

    fn write_body(&self, _buf: &mut BytesMut) {}

    fn read_body(_buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Cancel)
    }
}
