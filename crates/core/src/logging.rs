use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_facade(self) -> log::Level {
        match self {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// A single pipeline log line. `task_id` is set when the record was
/// produced while a task was being driven.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

pub type SharedLogSink = Arc<dyn LogSink>;

#[derive(Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord) {}
}

#[derive(Default)]
pub struct VecLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl VecLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|record| record.level == level && record.message.contains(needle))
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

/// Forwards records to whatever `log` implementation the host installed.
#[derive(Default, Clone)]
pub struct FacadeLogSink {
    target: Option<&'static str>,
}

impl FacadeLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(target: &'static str) -> Self {
        Self {
            target: Some(target),
        }
    }
}

impl LogSink for FacadeLogSink {
    fn log(&self, record: LogRecord) {
        let target = self.target.unwrap_or(module_path!());
        let level = record.level.as_facade();
        match record.task_id.as_deref() {
            Some(task) => log::log!(target: target, level, "[{}] {}", task, record.message),
            None => log::log!(target: target, level, "{}", record.message),
        }
    }
}

/// Stamps every record with the task it belongs to before handing it on.
pub struct TaskLogSink<'a> {
    inner: &'a dyn LogSink,
    task_id: String,
}

impl<'a> TaskLogSink<'a> {
    pub fn new(inner: &'a dyn LogSink, task_id: impl Into<String>) -> Self {
        Self {
            inner,
            task_id: task_id.into(),
        }
    }
}

impl LogSink for TaskLogSink<'_> {
    fn log(&self, record: LogRecord) {
        self.inner.log(record.for_task(self.task_id.clone()));
    }
}
