use std::collections::BTreeMap;

use bytes::BytesMut;
use chrono::Utc;

use super::{NodePacket, PacketType};
use crate::wire::{self, WireError};

/// Launcher -> task host: run one task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskCommand {
    pub task_name: String,
    pub working_directory: String,
    pub environment: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub culture: String,
    pub ui_culture: String,
    /// Task-level timeout; unioned with transport cancellation on the host.
    pub timeout_ms: Option<i64>,
}

impl NodePacket for TaskCommand {
    const TYPE: PacketType = PacketType::TaskCommand;

    fn write_body(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.task_name);
        wire::put_string(buf, &self.working_directory);
        wire::put_string_map(buf, &self.environment);
        wire::put_string_map(buf, &self.parameters);
        wire::put_string(buf, &self.culture);
        wire::put_string(buf, &self.ui_culture);
        wire::put_bool(buf, self.timeout_ms.is_some());
        if let Some(timeout) = self.timeout_ms {
            wire::put_i64(buf, timeout);
        }
    }

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError> {
        let task_name = wire::get_string(buf)?;
        let working_directory = wire::get_string(buf)?;
        let environment = wire::get_string_map(buf)?;
        let parameters = wire::get_string_map(buf)?;
        let culture = wire::get_string(buf)?;
        let ui_culture = wire::get_string(buf)?;
        let timeout_ms = if wire::get_bool(buf)? {
            Some(wire::get_i64(buf)?)
        } else {
            None
        };
        Ok(Self {
            task_name,
            working_directory,
            environment,
            parameters,
            culture,
            ui_culture,
            timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TaskResultKind {
    Success = 0,
    Failure = 1,
    CrashedDuringInitialization = 2,
    CrashedDuringExecution = 3,
    CrashedAfterExecution = 4,
}

impl TaskResultKind {
    fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            2 => Some(Self::CrashedDuringInitialization),
            3 => Some(Self::CrashedDuringExecution),
            4 => Some(Self::CrashedAfterExecution),
            _ => None,
        }
    }
}

/// Task host -> launcher: terminal packet of the task conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskComplete {
    pub result: TaskResultKind,
    pub error: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

impl TaskComplete {
    pub fn success(outputs: BTreeMap<String, String>) -> Self {
        Self {
            result: TaskResultKind::Success,
            error: None,
            outputs,
        }
    }

    pub fn with_error(result: TaskResultKind, error: impl Into<String>) -> Self {
        Self {
            result,
            error: Some(error.into()),
            outputs: BTreeMap::new(),
        }
    }
}

impl NodePacket for TaskComplete {
    const TYPE: PacketType = PacketType::TaskComplete;

    fn write_body(&self, buf: &mut BytesMut) {
        wire::put_i32(buf, self.result as i32);
        wire::put_opt_string(buf, self.error.as_deref());
        wire::put_string_map(buf, &self.outputs);
    }

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError> {
        let raw = wire::get_i32(buf)?;
        let result = TaskResultKind::from_i32(raw).ok_or(WireError::InvalidValue {
            field: "task result",
            value: i64::from(raw),
        })?;
        Ok(Self {
            result,
            error: wire::get_opt_string(buf)?,
            outputs: wire::get_string_map(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    Message = 0,
    Warning = 1,
    Error = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogImportance {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl LogImportance {
    /// Case-insensitive; anything unrecognised is `Normal`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: LogKind,
    pub importance: LogImportance,
    pub text: String,
    pub code: Option<String>,
    pub file: Option<String>,
    pub line: i32,
    pub timestamp_ms: i64,
}

impl LogEvent {
    pub fn message(importance: LogImportance, text: impl Into<String>) -> Self {
        Self::new(LogKind::Message, importance, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(LogKind::Warning, LogImportance::High, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LogKind::Error, LogImportance::High, text)
    }

    fn new(kind: LogKind, importance: LogImportance, text: impl Into<String>) -> Self {
        Self {
            kind,
            importance,
            text: text.into(),
            code: None,
            file: None,
            line: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Task host -> launcher: one structured log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub event: LogEvent,
}

impl From<LogEvent> for LogMessage {
    fn from(event: LogEvent) -> Self {
        Self { event }
    }
}

impl NodePacket for LogMessage {
    const TYPE: PacketType = PacketType::LogMessage;

    fn write_body(&self, buf: &mut BytesMut) {
        let event = &self.event;
        wire::put_u8(buf, event.kind as u8);
        wire::put_u8(buf, event.importance as u8);
        wire::put_string(buf, &event.text);
        wire::put_opt_string(buf, event.code.as_deref());
        wire::put_opt_string(buf, event.file.as_deref());
        wire::put_i32(buf, event.line);
        wire::put_i64(buf, event.timestamp_ms);
    }

    fn read_body(buf: &mut &[u8]) -> Result<Self, WireError> {
        let kind = match wire::get_u8(buf)? {
            0 => LogKind::Message,
            1 => LogKind::Warning,
            2 => LogKind::Error,
            other => {
                return Err(WireError::InvalidValue {
                    field: "log kind",
                    value: i64::from(other),
                })
            }
        };
        let importance = match wire::get_u8(buf)? {
            0 => LogImportance::High,
            1 => LogImportance::Normal,
            2 => LogImportance::Low,
            other => {
                return Err(WireError::InvalidValue {
                    field: "log importance",
                    value: i64::from(other),
                })
            }
        };
        Ok(Self {
            event: LogEvent {
                kind,
                importance,
                text: wire::get_string(buf)?,
                code: wire::get_opt_string(buf)?,
                file: wire::get_opt_string(buf)?,
                line: wire::get_i32(buf)?,
                timestamp_ms: wire::get_i64(buf)?,
            },
        })
    }
}
