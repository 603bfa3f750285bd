use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::broadcast;

/// Entries kept for observers that fall behind; older entries are dropped
const LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// `MessageLogged` observer channel.
///
/// Emitting never blocks: entries go to the `log` facade and to a bounded
/// broadcast channel. Each observer gets its own receiver from `subscribe`; an
/// observer that lags by more than `LOG_CAPACITY` entries loses the oldest ones.
#[derive(Clone)]
pub struct MessageLog {
    tx: broadcast::Sender<LogEvent>,
}

impl MessageLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        log::log!(level.into(), "{}", message);

        // No observers is fine
        let _ = self.tx.send(LogEvent {
            level,
            message,
            timestamp: Local::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message);
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}
