//! Buffered structured logger.
//!
//! Every entry is filtered by severity, mirrored to the console (through
//! `tracing`, so the normal subscriber handles formatting and colors), and
//! appended to a bounded in-memory buffer. A background flusher writes the
//! buffer to the `app_logs` table in batches, triggered by buffer size or a
//! fixed interval, whichever comes first. ERROR/FATAL entries additionally
//! fire a best-effort alert webhook.
//!
//! Logging is best-effort by contract: a failed flush re-queues the batch
//! (bounded by buffer capacity, oldest entries dropped) and nothing in here
//! ever panics or propagates an error into the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::types::{LogCategory, LogContext, LogEntry, LogLevel, SecuritySeverity};

pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Entries below this level are dropped before any side effect.
    pub min_level: LogLevel,
    pub console_enabled: bool,
    pub persist_enabled: bool,
    pub buffer_size: usize,
    pub flush_interval: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            console_enabled: true,
            persist_enabled: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl LoggerConfig {
    /// Load logger settings from environment variables.
    ///
    /// `LOG_MIN_LEVEL` overrides the default (INFO in production, DEBUG
    /// otherwise, keyed off `ENVIRONMENT`). `LOG_CONSOLE` / `LOG_PERSIST`
    /// toggle the sinks, `LOG_BUFFER_SIZE` bounds the buffer.
    pub fn from_env() -> Self {
        let production = std::env::var("ENVIRONMENT")
            .map(|e| e.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let default_level = if production {
            LogLevel::Info
        } else {
            LogLevel::Debug
        };

        let min_level = std::env::var("LOG_MIN_LEVEL")
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or(default_level);

        let buffer_size = std::env::var("LOG_BUFFER_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(DEFAULT_BUFFER_SIZE);

        Self {
            min_level,
            console_enabled: env_flag("LOG_CONSOLE", true),
            persist_enabled: env_flag("LOG_PERSIST", true),
            buffer_size,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no"),
        Err(_) => default,
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Persistent write target for flushed batches.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, entries: &[LogEntry]) -> Result<()>;
}

/// Writes batches into the `app_logs` table.
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn write_batch(&self, entries: &[LogEntry]) -> Result<()> {
        db::queries::logs::insert_batch(&self.pool, entries).await
    }
}

/// Captures flushed batches in memory for assertions in tests.
#[derive(Default)]
pub struct FakeLogSink {
    batches: Mutex<Vec<Vec<LogEntry>>>,
    failing: AtomicBool,
}

impl FakeLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().clone()
    }

    pub fn total_entries(&self) -> usize {
        self.batches.lock().iter().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl LogSink for FakeLogSink {
    async fn write_batch(&self, entries: &[LogEntry]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        self.batches.lock().push(entries.to_vec());
        Ok(())
    }
}

// =============================================================================
// Alerting
// =============================================================================

/// Best-effort external notification for ERROR/FATAL entries.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, entry: &LogEntry) -> Result<()>;
}

/// POSTs the offending entry as JSON to a webhook.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, entry: &LogEntry) -> Result<()> {
        self.client
            .post(&self.url)
            .json(entry)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Collects alerted entries in memory for assertions in tests.
#[derive(Default)]
pub struct FakeAlertSink {
    pub alerted: Mutex<Vec<LogEntry>>,
}

impl FakeAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.alerted.lock().len()
    }
}

#[async_trait]
impl AlertSink for FakeAlertSink {
    async fn notify(&self, entry: &LogEntry) -> Result<()> {
        self.alerted.lock().push(entry.clone());
        Ok(())
    }
}

// =============================================================================
// BufferedLogger
// =============================================================================

pub struct BufferedLogger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
    alert: Option<Arc<dyn AlertSink>>,
    buffer: Mutex<VecDeque<LogEntry>>,
    flush_signal: Notify,
}

impl BufferedLogger {
    pub fn new(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(config.buffer_size)),
            config,
            sink,
            alert: None,
            flush_signal: Notify::new(),
        }
    }

    pub fn with_alert(mut self, alert: Arc<dyn AlertSink>) -> Self {
        self.alert = Some(alert);
        self
    }

    /// Number of entries currently waiting for a flush.
    pub fn buffered_count(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Record a fully-built entry. This is the single funnel every wrapper
    /// goes through: severity filter, console mirror, buffer append, alert.
    pub fn submit(&self, entry: LogEntry) {
        if entry.level < self.config.min_level {
            return;
        }

        if self.config.console_enabled {
            console_write(&entry);
        }

        if entry.level >= LogLevel::Error {
            self.dispatch_alert(&entry);
        }

        if self.config.persist_enabled {
            let should_flush = {
                let mut buffer = self.buffer.lock();
                // Oldest entries give way when the flusher cannot keep up.
                if buffer.len() >= self.config.buffer_size {
                    buffer.pop_front();
                }
                buffer.push_back(entry);
                buffer.len() >= self.config.buffer_size
            };
            if should_flush {
                self.flush_signal.notify_one();
            }
        }
    }

    pub fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entry = LogEntry::new(level, category, message);
        entry.metadata = metadata;
        self.submit(entry);
    }

    pub fn debug(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Debug, category, message, metadata);
    }

    pub fn info(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Info, category, message, metadata);
    }

    pub fn warn(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Warn, category, message, metadata);
    }

    pub fn error(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Error, category, message, metadata);
    }

    pub fn fatal(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Fatal, category, message, metadata);
    }

    /// Timing entry for a named operation.
    pub fn performance(
        &self,
        category: LogCategory,
        operation: &str,
        duration_ms: u64,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entry = LogEntry::new(
            LogLevel::Info,
            category,
            format!("{} completed", operation),
        )
        .with_duration_ms(duration_ms);
        entry.metadata = metadata;
        entry.tags.push("performance".to_string());
        self.submit(entry);
    }

    /// Security event; severity maps onto the log level.
    pub fn security(
        &self,
        message: impl Into<String>,
        severity: SecuritySeverity,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entry = LogEntry::new(severity.level(), LogCategory::Security, message);
        entry.metadata = metadata;
        entry.tags.push("security".to_string());
        self.submit(entry);
    }

    /// Request outcome entry; the level derives from the status code.
    pub fn api(
        &self,
        method: &str,
        endpoint: &str,
        status_code: u16,
        duration_ms: u64,
        metadata: Option<serde_json::Value>,
    ) {
        let level = match status_code {
            s if s >= 500 => LogLevel::Error,
            s if s >= 400 => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        let mut entry = LogEntry::new(
            level,
            LogCategory::Api,
            format!("{} {} -> {}", method, endpoint, status_code),
        )
        .with_duration_ms(duration_ms);
        entry.metadata = metadata;
        self.submit(entry);
    }

    /// Database operation entry; errors raise the level.
    pub fn database(
        &self,
        operation: &str,
        table: &str,
        duration_ms: u64,
        rows_affected: Option<u64>,
        error: Option<&str>,
    ) {
        let level = if error.is_some() {
            LogLevel::Error
        } else {
            LogLevel::Debug
        };
        let mut entry = LogEntry::new(
            level,
            LogCategory::Database,
            format!("{} {}", operation, table),
        )
        .with_duration_ms(duration_ms);
        if let Some(rows) = rows_affected {
            entry.metadata = Some(serde_json::json!({ "rowsAffected": rows }));
        }
        if let Some(err) = error {
            entry.error = Some(err.to_string());
        }
        self.submit(entry);
    }

    /// Handle that stamps request-scoped identifiers onto every entry.
    pub fn scoped(self: &Arc<Self>, ctx: LogContext) -> ScopedLogger {
        ScopedLogger {
            inner: Arc::clone(self),
            ctx,
        }
    }

    fn dispatch_alert(&self, entry: &LogEntry) {
        let Some(alert) = &self.alert else {
            return;
        };
        // Fire and forget; an alert failure must never reach the caller.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let alert = Arc::clone(alert);
            let entry = entry.clone();
            handle.spawn(async move {
                if let Err(e) = alert.notify(&entry).await {
                    tracing::warn!("Alert notification failed: {}", e);
                }
            });
        }
    }

    /// Drain the buffer and write one batch. On failure the batch goes back
    /// to the front of the buffer, clamped to capacity (oldest dropped).
    pub async fn flush_now(&self) {
        let batch: Vec<LogEntry> = {
            let mut buffer = self.buffer.lock();
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        if let Err(e) = self.sink.write_batch(&batch).await {
            tracing::error!("Log flush failed, re-queueing {} entries: {}", batch.len(), e);
            let mut buffer = self.buffer.lock();
            for entry in batch.into_iter().rev() {
                buffer.push_front(entry);
            }
            while buffer.len() > self.config.buffer_size {
                buffer.pop_front();
            }
        }
    }

    /// Spawn the background flusher. Flushes on the configured interval or
    /// when the buffer-full signal fires; a final flush runs on cancellation.
    pub fn spawn_flusher(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(logger.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the timer
            // measures a full interval from startup.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => logger.flush_now().await,
                    _ = logger.flush_signal.notified() => logger.flush_now().await,
                    _ = token.cancelled() => {
                        logger.flush_now().await;
                        break;
                    }
                }
            }
        })
    }
}

/// Mirror an entry to the console through `tracing`, so level colors and
/// formatting come from the installed subscriber.
fn console_write(entry: &LogEntry) {
    let category = entry.category.as_str();
    let duration_ms = entry.duration_ms;
    let request_id = entry.request_id.as_deref();
    let user_id = entry.user_id.as_deref();
    let error = entry.error.as_deref();

    match entry.level {
        LogLevel::Debug => tracing::debug!(
            category, duration_ms, request_id, user_id, error, "{}", entry.message
        ),
        LogLevel::Info => tracing::info!(
            category, duration_ms, request_id, user_id, error, "{}", entry.message
        ),
        LogLevel::Warn => tracing::warn!(
            category, duration_ms, request_id, user_id, error, "{}", entry.message
        ),
        LogLevel::Error | LogLevel::Fatal => tracing::error!(
            category, duration_ms, request_id, user_id, error, "{}", entry.message
        ),
    }
}

// =============================================================================
// ScopedLogger
// =============================================================================

/// A `BufferedLogger` handle carrying request-scoped context.
#[derive(Clone)]
pub struct ScopedLogger {
    inner: Arc<BufferedLogger>,
    ctx: LogContext,
}

impl ScopedLogger {
    pub fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entry = LogEntry::new(level, category, message).apply_context(&self.ctx);
        entry.metadata = metadata;
        self.inner.submit(entry);
    }

    pub fn debug(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Debug, category, message, metadata);
    }

    pub fn info(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Info, category, message, metadata);
    }

    pub fn warn(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Warn, category, message, metadata);
    }

    pub fn error(&self, category: LogCategory, message: impl Into<String>, metadata: Option<serde_json::Value>) {
        self.log(LogLevel::Error, category, message, metadata);
    }

    pub fn api(
        &self,
        method: &str,
        endpoint: &str,
        status_code: u16,
        duration_ms: u64,
        metadata: Option<serde_json::Value>,
    ) {
        let level = match status_code {
            s if s >= 500 => LogLevel::Error,
            s if s >= 400 => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        let mut entry = LogEntry::new(
            level,
            LogCategory::Api,
            format!("{} {} -> {}", method, endpoint, status_code),
        )
        .with_duration_ms(duration_ms)
        .apply_context(&self.ctx);
        entry.metadata = metadata;
        self.inner.submit(entry);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(buffer_size: usize, flush_interval: Duration) -> LoggerConfig {
        LoggerConfig {
            min_level: LogLevel::Debug,
            console_enabled: false,
            persist_enabled: true,
            buffer_size,
            flush_interval,
        }
    }

    fn logger_with_sink(buffer_size: usize) -> (Arc<BufferedLogger>, Arc<FakeLogSink>) {
        let sink = Arc::new(FakeLogSink::new());
        let logger = Arc::new(BufferedLogger::new(
            test_config(buffer_size, Duration::from_secs(3600)),
            sink.clone(),
        ));
        (logger, sink)
    }

    #[test]
    fn test_severity_filter_drops_below_min_level() {
        let sink = Arc::new(FakeLogSink::new());
        let config = LoggerConfig {
            min_level: LogLevel::Warn,
            ..test_config(10, Duration::from_secs(3600))
        };
        let logger = BufferedLogger::new(config, sink);

        logger.debug(LogCategory::System, "dropped", None);
        logger.info(LogCategory::System, "dropped", None);
        assert_eq!(logger.buffered_count(), 0);

        logger.warn(LogCategory::System, "kept", None);
        logger.error(LogCategory::System, "kept", None);
        logger.fatal(LogCategory::System, "kept", None);
        assert_eq!(logger.buffered_count(), 3);
    }

    #[tokio::test]
    async fn test_buffer_size_triggers_single_flush() {
        let (logger, sink) = logger_with_sink(3);
        let token = CancellationToken::new();
        let handle = logger.spawn_flusher(token.clone());

        logger.info(LogCategory::Api, "one", None);
        logger.info(LogCategory::Api, "two", None);
        logger.info(LogCategory::Api, "three", None);

        // Give the flusher a chance to react to the size signal.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(logger.buffered_count(), 0);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_buffer() {
        let sink = Arc::new(FakeLogSink::new());
        let logger = Arc::new(BufferedLogger::new(
            test_config(100, Duration::from_millis(200)),
            sink.clone(),
        ));
        let token = CancellationToken::new();
        let handle = logger.spawn_flusher(token.clone());

        logger.info(LogCategory::Api, "lonely", None);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].message, "lonely");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_failure_requeues_batch() {
        let (logger, sink) = logger_with_sink(10);

        sink.set_failing(true);
        logger.info(LogCategory::Api, "a", None);
        logger.info(LogCategory::Api, "b", None);
        logger.flush_now().await;

        // Nothing written, everything back in the buffer.
        assert_eq!(sink.batches().len(), 0);
        assert_eq!(logger.buffered_count(), 2);

        sink.set_failing(false);
        logger.flush_now().await;
        assert_eq!(sink.total_entries(), 2);
        assert_eq!(logger.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_capacity() {
        let (logger, sink) = logger_with_sink(3);
        sink.set_failing(true);

        for i in 0..5 {
            logger.info(LogCategory::Api, format!("msg-{}", i), None);
        }

        assert_eq!(logger.buffered_count(), 3);

        // Oldest entries were dropped.
        sink.set_failing(false);
        logger.flush_now().await;
        let batch = &sink.batches()[0];
        let messages: Vec<&str> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let (logger, sink) = logger_with_sink(100);
        let token = CancellationToken::new();
        let handle = logger.spawn_flusher(token.clone());

        logger.info(LogCategory::System, "goodbye", None);
        token.cancel();
        handle.await.unwrap();

        assert_eq!(sink.total_entries(), 1);
    }

    #[tokio::test]
    async fn test_alert_fires_for_error_and_above() {
        let sink = Arc::new(FakeLogSink::new());
        let alert = Arc::new(FakeAlertSink::new());
        let logger = BufferedLogger::new(test_config(100, Duration::from_secs(3600)), sink)
            .with_alert(alert.clone());

        logger.info(LogCategory::System, "fine", None);
        logger.error(LogCategory::System, "broken", None);
        logger.fatal(LogCategory::System, "very broken", None);

        // Alerts are spawned tasks; yield so they run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alert.count(), 2);
    }

    #[test]
    fn test_api_wrapper_level_from_status() {
        let (logger, _sink) = logger_with_sink(100);

        logger.api("GET", "/api/companies", 200, 12, None);
        logger.api("POST", "/api/search", 404, 5, None);
        logger.api("POST", "/api/reports", 502, 30_000, None);

        let levels: Vec<LogLevel> = logger.buffer.lock().iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Warn, LogLevel::Error]);
    }

    #[test]
    fn test_database_wrapper_error_raises_level() {
        let (logger, _sink) = logger_with_sink(100);

        logger.database("SELECT", "companies", 3, Some(10), None);
        logger.database("UPDATE", "enrichments", 8, None, Some("connection reset"));

        let buffer = logger.buffer.lock();
        assert_eq!(buffer[0].level, LogLevel::Debug);
        assert_eq!(buffer[1].level, LogLevel::Error);
        assert_eq!(buffer[1].error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_security_wrapper_maps_severity() {
        let (logger, _sink) = logger_with_sink(100);

        logger.security("token reuse detected", SecuritySeverity::Critical, None);
        logger.security("odd user agent", SecuritySeverity::Low, None);

        let buffer = logger.buffer.lock();
        assert_eq!(buffer[0].level, LogLevel::Error);
        assert_eq!(buffer[0].category, LogCategory::Security);
        assert_eq!(buffer[1].level, LogLevel::Info);
    }

    #[test]
    fn test_scoped_logger_stamps_context() {
        let (logger, _sink) = logger_with_sink(100);
        let scoped = logger.scoped(LogContext::for_request("req-42").with_user("user-7"));

        scoped.info(LogCategory::Api, "scoped entry", None);

        let buffer = logger.buffer.lock();
        assert_eq!(buffer[0].request_id.as_deref(), Some("req-42"));
        assert_eq!(buffer[0].user_id.as_deref(), Some("user-7"));
    }

    #[test]
    fn test_persist_disabled_buffers_nothing() {
        let sink = Arc::new(FakeLogSink::new());
        let config = LoggerConfig {
            persist_enabled: false,
            ..test_config(100, Duration::from_secs(3600))
        };
        let logger = BufferedLogger::new(config, sink);

        logger.info(LogCategory::System, "console only", None);
        assert_eq!(logger.buffered_count(), 0);
    }
}
