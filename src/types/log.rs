//! Structured log entry types shared by the buffered logger and its sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log severity, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Parse a level name, case-insensitive. Unknown names return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// Domain tag attached to every log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Authentication,
    Database,
    Api,
    Security,
    ExternalApi,
    CronJob,
    RateLimit,
    System,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Authentication => "authentication",
            LogCategory::Database => "database",
            LogCategory::Api => "api",
            LogCategory::Security => "security",
            LogCategory::ExternalApi => "external_api",
            LogCategory::CronJob => "cron_job",
            LogCategory::RateLimit => "rate_limit",
            LogCategory::System => "system",
        }
    }
}

/// Severity grades used by the `security(..)` convenience wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    /// Map a security severity onto a log level.
    pub fn level(self) -> LogLevel {
        match self {
            SecuritySeverity::Critical | SecuritySeverity::High => LogLevel::Error,
            SecuritySeverity::Medium => LogLevel::Warn,
            SecuritySeverity::Low => LogLevel::Info,
        }
    }
}

/// Request-scoped identifiers stamped onto log entries.
///
/// Passed explicitly (via `BufferedLogger::scoped`) rather than stored in a
/// process-wide singleton, so interleaved requests cannot leak each other's
/// identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub component: Option<String>,
}

impl LogContext {
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

/// A single structured log entry as buffered and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            level,
            category,
            message: message.into(),
            metadata: None,
            user_id: None,
            session_id: None,
            request_id: None,
            component: None,
            timestamp: Utc::now(),
            duration_ms: None,
            error: None,
            tags: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Stamp request-scoped identifiers onto the entry.
    pub fn apply_context(mut self, ctx: &LogContext) -> Self {
        self.user_id = ctx.user_id.clone();
        self.session_id = ctx.session_id.clone();
        self.request_id = ctx.request_id.clone();
        self.component = ctx.component.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn test_level_parse_case_insensitive() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("nope"), None);
    }

    #[test]
    fn test_security_severity_mapping() {
        assert_eq!(SecuritySeverity::Critical.level(), LogLevel::Error);
        assert_eq!(SecuritySeverity::High.level(), LogLevel::Error);
        assert_eq!(SecuritySeverity::Medium.level(), LogLevel::Warn);
        assert_eq!(SecuritySeverity::Low.level(), LogLevel::Info);
    }

    #[test]
    fn test_entry_builders() {
        let entry = LogEntry::new(LogLevel::Error, LogCategory::ExternalApi, "enrich failed")
            .with_metadata(serde_json::json!({ "provider": "apollo" }))
            .with_duration_ms(412)
            .with_error("504 Gateway Timeout");

        assert_eq!(entry.metadata.unwrap()["provider"], "apollo");
        assert_eq!(entry.duration_ms, Some(412));
        assert_eq!(entry.error.as_deref(), Some("504 Gateway Timeout"));
    }

    #[test]
    fn test_apply_context_stamps_identifiers() {
        let ctx = LogContext::for_request("req-1")
            .with_user("user-1")
            .with_component("cron");

        let entry = LogEntry::new(LogLevel::Info, LogCategory::CronJob, "hello")
            .apply_context(&ctx);

        assert_eq!(entry.request_id.as_deref(), Some("req-1"));
        assert_eq!(entry.user_id.as_deref(), Some("user-1"));
        assert_eq!(entry.component.as_deref(), Some("cron"));
        assert!(entry.session_id.is_none());
    }
}
