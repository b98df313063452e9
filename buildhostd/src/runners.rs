//! Tasks a task host knows how to run.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use buildhost_common::{BuildContext, BuildEngine, CommandBuildEngine, ConsoleSink, ConsoleStream, ExitType};
use buildhost_protocol::{LogEvent, LogImportance, LogMessage, Packet};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub type TaskOutputs = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("required parameter {0} is missing")]
    MissingParameter(&'static str),
    #[error("task was cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// Sends structured log events back to the task launcher.
#[derive(Clone)]
pub struct TaskLog {
    out: UnboundedSender<Packet>,
}

impl TaskLog {
    pub fn new(out: UnboundedSender<Packet>) -> Self {
        Self { out }
    }

    pub fn event(&self, event: LogEvent) {
        let _ = self.out.send(LogMessage::from(event).into());
    }

    pub fn message(&self, importance: LogImportance, text: impl Into<String>) {
        self.event(LogEvent::message(importance, text));
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.event(LogEvent::warning(text));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.event(LogEvent::error(text));
    }
}

pub struct TaskContext {
    pub parameters: BTreeMap<String, String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub log: TaskLog,
    /// Fires on a transport `Cancel` or when the task's own timeout expires.
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn parameter(&self, name: &'static str) -> Result<&str, TaskError> {
        self.parameters
            .get(name)
            .map(String::as_str)
            .ok_or(TaskError::MissingParameter(name))
    }

    pub fn optional(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Runs on a blocking worker thread inside the task host.
pub trait TaskRunner: Send + Sync {
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutputs, TaskError>;
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Message` and `Exec`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("Message", MessageTask);
        registry.register("Exec", ExecTask);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, runner: impl TaskRunner + 'static) {
        self.runners.insert(name.into(), Arc::new(runner));
    }

    /// Task names match case-insensitively.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskRunner>> {
        self.runners
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, runner)| runner.clone())
    }
}

/// Logs `Text` at `Importance` (default normal).
pub struct MessageTask;

impl TaskRunner for MessageTask {
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutputs, TaskError> {
        let text = ctx.parameter("Text")?;
        let importance = ctx
            .optional("Importance")
            .map(LogImportance::parse)
            .unwrap_or(LogImportance::Normal);
        ctx.log.message(importance, text);
        Ok(TaskOutputs::new())
    }
}

/// Runs `Command` through the platform shell and relays output line by line.
///
/// A non-zero exit fails the task unless `IgnoreExitCode` is `true`. The exit
/// code is always returned as the `ExitCode` output.
pub struct ExecTask;

impl TaskRunner for ExecTask {
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutputs, TaskError> {
        let command = ctx.parameter("Command")?;
        let ignore_exit_code = ctx
            .optional("IgnoreExitCode")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let relay = Arc::new(LineLog::new(ctx.log.clone()));
        let build = BuildContext {
            command_line: command.to_string(),
            working_directory: ctx.working_directory.clone(),
            environment: ctx.environment.clone(),
            culture: String::new(),
            ui_culture: String::new(),
            console: relay.clone(),
            cancellation: ctx.cancellation.clone(),
        };
        let outcome = CommandBuildEngine::new().build(&build);
        relay.finish();

        if ctx.cancellation.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        if outcome.exit_type == ExitType::InitializationError {
            return Err(TaskError::Failed(format!("failed to start `{}`", command)));
        }

        let mut outputs = TaskOutputs::new();
        outputs.insert("ExitCode".to_string(), outcome.exit_code.to_string());
        if outcome.exit_code != 0 && !ignore_exit_code {
            return Err(TaskError::Failed(format!(
                "`{}` exited with code {}",
                command, outcome.exit_code
            )));
        }
        Ok(outputs)
    }
}

/// Console sink that turns chunks into one log event per line.
struct LineLog {
    log: TaskLog,
    partial: Mutex<[String; 2]>,
}

impl LineLog {
    fn new(log: TaskLog) -> Self {
        Self {
            log,
            partial: Mutex::new([String::new(), String::new()]),
        }
    }

    fn emit(&self, stream: ConsoleStream, line: &str) {
        let line = line.trim_end_matches('\r');
        match stream {
            ConsoleStream::Stdout => self.log.message(LogImportance::Normal, line),
            ConsoleStream::Stderr => self.log.warning(line),
        }
    }

    fn finish(&self) {
        let mut partial = self.partial.lock().unwrap_or_else(|p| p.into_inner());
        for (index, stream) in [ConsoleStream::Stdout, ConsoleStream::Stderr].into_iter().enumerate() {
            let rest = std::mem::take(&mut partial[index]);
            if !rest.is_empty() {
                self.emit(stream, &rest);
            }
        }
    }
}

impl ConsoleSink for LineLog {
    fn write(&self, stream: ConsoleStream, text: &str) {
        let index = match stream {
            ConsoleStream::Stdout => 0,
            ConsoleStream::Stderr => 1,
        };
        let mut partial = self.partial.lock().unwrap_or_else(|p| p.into_inner());
        let buffer = &mut partial[index];
        buffer.push_str(text);
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            self.emit(stream, &line[..line.len() - 1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildhost_protocol::LogKind;
    use tokio::sync::mpsc;

    fn context(params: &[(&str, &str)]) -> (TaskContext, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TaskContext {
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            working_directory: std::env::temp_dir(),
            environment: BTreeMap::new(),
            log: TaskLog::new(tx),
            cancellation: CancellationToken::new(),
        };
        (ctx, rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<LogEvent> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            if let Packet::LogMessage(msg) = packet {
                out.push(msg.event);
            }
        }
        out
    }

    #[test]
    fn registry_lookup_ignores_case() {
        let registry = TaskRegistry::with_builtins();
        assert!(registry.get("message").is_some());
        assert!(registry.get("EXEC").is_some());
        assert!(registry.get("Copy").is_none());
    }

    #[test]
    fn message_task_logs_text_at_importance() {
        let (ctx, mut rx) = context(&[("Text", "hello"), ("Importance", "high")]);
        MessageTask.execute(&ctx).unwrap();
        let logged = events(&mut rx);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].text, "hello");
        assert_eq!(logged[0].importance, LogImportance::High);
        assert_eq!(logged[0].kind, LogKind::Message);
    }

    #[test]
    fn message_task_requires_text() {
        let (ctx, _rx) = context(&[]);
        assert_eq!(
            MessageTask.execute(&ctx),
            Err(TaskError::MissingParameter("Text"))
        );
    }

    #[test]
    fn line_log_splits_chunks_into_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = LineLog::new(TaskLog::new(tx));
        sink.write(ConsoleStream::Stdout, "one\ntw");
        sink.write(ConsoleStream::Stdout, "o\r\nthree");
        sink.write(ConsoleStream::Stderr, "bad\n");
        sink.finish();
        let texts: Vec<(LogKind, String)> = events(&mut rx)
            .into_iter()
            .map(|e| (e.kind, e.text))
            .collect();
        assert_eq!(
            texts,
            vec![
                (LogKind::Message, "one".to_string()),
                (LogKind::Message, "two".to_string()),
                (LogKind::Warning, "bad".to_string()),
                (LogKind::Message, "three".to_string()),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn exec_task_relays_output_and_exit_code() {
        let (ctx, mut rx) = context(&[("Command", "echo built; exit 0")]);
        let outputs = ExecTask.execute(&ctx).unwrap();
        assert_eq!(outputs.get("ExitCode").map(String::as_str), Some("0"));
        assert!(events(&mut rx).iter().any(|e| e.text == "built"));

        let (ctx, _rx) = context(&[("Command", "exit 4")]);
        assert!(matches!(ExecTask.execute(&ctx), Err(TaskError::Failed(_))));

        let (ctx, _rx) = context(&[("Command", "exit 4"), ("IgnoreExitCode", "true")]);
        let outputs = ExecTask.execute(&ctx).unwrap();
        assert_eq!(outputs.get("ExitCode").map(String::as_str), Some("4"));
    }

    #[cfg(unix)]
    #[test]
    fn exec_task_honours_cancellation() {
        let (ctx, _rx) = context(&[("Command", "sleep 30")]);
        ctx.cancellation.cancel();
        assert_eq!(ExecTask.execute(&ctx), Err(TaskError::Cancelled));
    }
}
