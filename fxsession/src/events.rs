use chrono::{DateTime, Utc};
use ctrader_api::BrokerError;
use tracing::Level;

use crate::session::ConnectionStatus;

/// Bus topics consumed by the presentation layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    StatusChanged,
    LogMessage,
    MetricPoint,
    Error,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Self::StatusChanged,
        Self::LogMessage,
        Self::MetricPoint,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusChanged => "status-changed",
            Self::LogMessage => "log-message",
            Self::MetricPoint => "metric-point",
            Self::Error => "error",
        }
    }
}

/// Everything published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Status(StatusChange),
    Log(LogLine),
    Metric(MetricPoint),
    Error(ErrorReport),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Status(_) => Topic::StatusChanged,
            Self::Log(_) => Topic::LogMessage,
            Self::Metric(_) => Topic::MetricPoint,
            Self::Error(_) => Topic::Error,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// A single log entry captured from tracing
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
}

impl MetricPoint {
    pub fn counter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 1.0,
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credential store missing or unreadable
    Credentials,
    /// Refresh failed; the user has to authorize again
    Reauthentication,
    /// Broker error with classification context
    Broker,
    /// A request timed out and will be retried
    Timeout,
    /// A request gave up
    RequestFailed,
    Network,
}

/// An error surfaced exactly once per causal event.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    /// Component that raised it
    pub source: &'static str,
    pub message: String,
    /// Raw broker code and its symbolic name when known
    pub code: Option<String>,
    pub code_name: Option<&'static str>,
    pub fatal: bool,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, source: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            source,
            message: message.into(),
            code: None,
            code_name: None,
            fatal: false,
        }
    }

    pub fn broker(source: &'static str, error: &BrokerError) -> Self {
        Self {
            kind: ErrorKind::Broker,
            source,
            message: error.to_string(),
            code: Some(error.error_code.clone()),
            code_name: ctrader_api::describe(&error.error_code),
            fatal: false,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.source, self.message)
    }
}
