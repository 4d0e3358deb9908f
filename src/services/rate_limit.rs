//! In-process rate limiting.
//!
//! Two counter stores (fixed window and sliding window) sit behind the
//! `CounterStore` trait, and `RateLimitService::evaluate` turns a caller
//! identity plus a route class into an allow/deny decision with standard
//! quota headers. Abuse-prone classes (auth, email) use the stricter
//! sliding-window store; the rest use the cheaper fixed window.
//!
//! Counters are process-local: limits are per worker instance, not global.
//! Deployments that need a shared quota can substitute an external store
//! through the trait without touching the decision logic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::logger::BufferedLogger;
use crate::types::LogCategory;

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Route classes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Api,
    Auth,
    Search,
    Email,
    Reports,
    Health,
}

/// Per-class quota settings.
#[derive(Debug, Clone, Copy)]
pub struct RouteConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    pub message: &'static str,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Api => "api",
            RouteClass::Auth => "auth",
            RouteClass::Search => "search",
            RouteClass::Email => "email",
            RouteClass::Reports => "reports",
            RouteClass::Health => "health",
        }
    }

    /// Auth and email gate abuse-prone or costly operations, so they get
    /// the tightest quotas and the stricter store.
    pub fn config(&self) -> RouteConfig {
        match self {
            RouteClass::Api => RouteConfig {
                window_ms: 60_000,
                max_requests: 100,
                message: "Too many requests, please slow down.",
            },
            RouteClass::Auth => RouteConfig {
                window_ms: 900_000,
                max_requests: 5,
                message: "Too many authentication attempts, try again later.",
            },
            RouteClass::Search => RouteConfig {
                window_ms: 60_000,
                max_requests: 30,
                message: "Search quota exhausted, please wait a moment.",
            },
            RouteClass::Email => RouteConfig {
                window_ms: 3_600_000,
                max_requests: 10,
                message: "Email quota exhausted for this hour.",
            },
            RouteClass::Reports => RouteConfig {
                window_ms: 3_600_000,
                max_requests: 20,
                message: "Report generation quota exhausted for this hour.",
            },
            RouteClass::Health => RouteConfig {
                window_ms: 10_000,
                max_requests: 60,
                message: "Health check quota exhausted.",
            },
        }
    }

    fn uses_sliding_window(&self) -> bool {
        matches!(self, RouteClass::Auth | RouteClass::Email)
    }
}

// =============================================================================
// Counter stores
// =============================================================================

/// Post-hit counter state for one key.
#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    /// Count including the hit just recorded.
    pub total_hits: u32,
    /// Epoch millis at which the current window ends.
    pub reset_at_ms: i64,
}

/// Storage for per-key request counters. Implementations must perform the
/// read-modify-write of a key as one atomic operation.
pub trait CounterStore: Send + Sync {
    /// Record one hit against `key` and return the post-hit state.
    fn hit(&self, key: &str, window_ms: u64, now_ms: i64) -> Result<CounterSnapshot>;

    /// Forget a key unconditionally (admin unblock).
    fn reset(&self, key: &str);

    /// Drop state whose window has fully elapsed.
    fn sweep(&self, now_ms: i64);
}

#[derive(Debug)]
struct FixedEntry {
    count: u32,
    reset_at_ms: i64,
}

/// Counts hits in discrete windows. An expired entry is replaced, never
/// incremented.
#[derive(Default)]
pub struct FixedWindowStore {
    entries: Mutex<HashMap<String, FixedEntry>>,
}

impl FixedWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for FixedWindowStore {
    fn hit(&self, key: &str, window_ms: u64, now_ms: i64) -> Result<CounterSnapshot> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(FixedEntry {
            count: 0,
            reset_at_ms: now_ms + window_ms as i64,
        });

        if entry.reset_at_ms <= now_ms {
            entry.count = 0;
            entry.reset_at_ms = now_ms + window_ms as i64;
        }
        entry.count += 1;

        Ok(CounterSnapshot {
            total_hits: entry.count,
            reset_at_ms: entry.reset_at_ms,
        })
    }

    fn reset(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn sweep(&self, now_ms: i64) {
        self.entries.lock().retain(|_, e| e.reset_at_ms > now_ms);
    }
}

/// Tracks individual hit timestamps per key, pruned on every access, so the
/// window moves continuously and boundary bursts cannot double the quota.
/// Costs O(max_requests) memory per key.
#[derive(Default)]
pub struct SlidingWindowStore {
    entries: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl SlidingWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for SlidingWindowStore {
    fn hit(&self, key: &str, window_ms: u64, now_ms: i64) -> Result<CounterSnapshot> {
        let cutoff = now_ms - window_ms as i64;
        let mut entries = self.entries.lock();
        let timestamps = entries.entry(key.to_string()).or_default();

        while timestamps.front().is_some_and(|&t| t <= cutoff) {
            timestamps.pop_front();
        }
        timestamps.push_back(now_ms);

        let oldest = *timestamps.front().unwrap_or(&now_ms);
        Ok(CounterSnapshot {
            total_hits: timestamps.len() as u32,
            reset_at_ms: oldest + window_ms as i64,
        })
    }

    fn reset(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn sweep(&self, now_ms: i64) {
        // Precise pruning happens per-hit with the real window; the sweep
        // only needs to drop keys no window could still count.
        self.entries.lock().retain(|_, timestamps| {
            timestamps.back().is_some_and(|&t| t > now_ms - MAX_WINDOW_MS)
        });
    }
}

/// Largest window across route classes; sweep keeps anything younger.
const MAX_WINDOW_MS: i64 = 3_600_000;

// =============================================================================
// Decision function
// =============================================================================

/// Outcome of a rate-limit evaluation, with everything a caller needs to
/// build a 429-style response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitDecision {
    fn allowed_full_quota(config: &RouteConfig, now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit: config.max_requests,
            remaining: config.max_requests,
            reset_epoch_secs: ceil_secs(now_ms + config.window_ms as i64),
            retry_after_secs: None,
            message: None,
        }
    }

    /// Standard quota headers. `Retry-After` is present only on deny.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_epoch_secs.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

fn ceil_secs(epoch_ms: i64) -> i64 {
    (epoch_ms + 999) / 1000
}

/// Derive the rate-limit identity for a request: the authenticated user when
/// present, otherwise a best-effort client IP.
///
/// The forwarded-for header is trusted outright, which is spoofable unless a
/// trusted proxy sets it; swap this function for a trusted-hop policy before
/// exposing the worker directly.
pub fn request_identity(
    user_id: Option<&str>,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
) -> String {
    if let Some(user) = user_id {
        return format!("user:{}", user);
    }
    if let Some(first) = forwarded_for
        .and_then(|ff| ff.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return format!("ip:{}", first);
    }
    if let Some(ip) = real_ip.map(str::trim).filter(|s| !s.is_empty()) {
        return format!("ip:{}", ip);
    }
    "ip:unknown".to_string()
}

pub struct RateLimitService {
    fixed: Arc<dyn CounterStore>,
    sliding: Arc<dyn CounterStore>,
    allowlist: HashSet<String>,
    logger: Arc<BufferedLogger>,
}

impl RateLimitService {
    pub fn new(logger: Arc<BufferedLogger>) -> Self {
        Self::with_stores(
            Arc::new(FixedWindowStore::new()),
            Arc::new(SlidingWindowStore::new()),
            logger,
        )
    }

    /// Substitution seam for an external/shared counter store.
    pub fn with_stores(
        fixed: Arc<dyn CounterStore>,
        sliding: Arc<dyn CounterStore>,
        logger: Arc<BufferedLogger>,
    ) -> Self {
        let allowlist = ["user:internal-monitor", "ip:127.0.0.1", "ip:::1"]
            .into_iter()
            .map(str::to_string)
            .collect();
        Self {
            fixed,
            sliding,
            allowlist,
            logger,
        }
    }

    pub fn with_allowlist(mut self, identities: impl IntoIterator<Item = String>) -> Self {
        self.allowlist.extend(identities);
        self
    }

    pub fn evaluate(&self, identity: &str, class: RouteClass) -> RateLimitDecision {
        self.evaluate_at(identity, class, now_ms())
    }

    /// Clock-parameterized evaluation; `evaluate` passes the current time.
    pub fn evaluate_at(&self, identity: &str, class: RouteClass, now_ms: i64) -> RateLimitDecision {
        let config = class.config();

        if self.allowlist.contains(identity) {
            return RateLimitDecision::allowed_full_quota(&config, now_ms);
        }

        let key = format!("{}:{}", class.as_str(), identity);
        let store = if class.uses_sliding_window() {
            &self.sliding
        } else {
            &self.fixed
        };

        let snapshot = match store.hit(&key, config.window_ms, now_ms) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Availability over strictness: a broken store never blocks
                // traffic, but it must be visible in the logs.
                self.logger.error(
                    LogCategory::RateLimit,
                    "Rate limit store failure, failing open",
                    Some(serde_json::json!({
                        "class": class.as_str(),
                        "identity": identity,
                        "error": e.to_string(),
                    })),
                );
                return RateLimitDecision::allowed_full_quota(&config, now_ms);
            }
        };

        let allowed = snapshot.total_hits <= config.max_requests;
        let remaining = config.max_requests.saturating_sub(snapshot.total_hits);
        let reset_epoch_secs = ceil_secs(snapshot.reset_at_ms);

        if allowed {
            RateLimitDecision {
                allowed: true,
                limit: config.max_requests,
                remaining,
                reset_epoch_secs,
                retry_after_secs: None,
                message: None,
            }
        } else {
            self.logger.warn(
                LogCategory::RateLimit,
                format!("Rate limit exceeded for {} ({})", identity, class.as_str()),
                Some(serde_json::json!({
                    "class": class.as_str(),
                    "totalHits": snapshot.total_hits,
                    "limit": config.max_requests,
                })),
            );
            RateLimitDecision {
                allowed: false,
                limit: config.max_requests,
                remaining: 0,
                reset_epoch_secs,
                retry_after_secs: Some((reset_epoch_secs - now_ms / 1000).max(0)),
                message: Some(config.message.to_string()),
            }
        }
    }

    /// Forget all counters for an identity across every class (admin unblock).
    pub fn reset_identity(&self, identity: &str) {
        for class in [
            RouteClass::Api,
            RouteClass::Auth,
            RouteClass::Search,
            RouteClass::Email,
            RouteClass::Reports,
            RouteClass::Health,
        ] {
            let key = format!("{}:{}", class.as_str(), identity);
            self.fixed.reset(&key);
            self.sliding.reset(&key);
        }
    }

    /// Spawn the periodic sweep that bounds counter memory.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = now_ms();
                        service.fixed.sweep(now);
                        service.sliding.sweep(now);
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::logger::{FakeLogSink, LoggerConfig};
    use crate::types::LogLevel;

    fn quiet_logger() -> (Arc<BufferedLogger>, Arc<FakeLogSink>) {
        let sink = Arc::new(FakeLogSink::new());
        let config = LoggerConfig {
            min_level: LogLevel::Debug,
            console_enabled: false,
            persist_enabled: true,
            buffer_size: 1000,
            flush_interval: Duration::from_secs(3600),
        };
        (
            Arc::new(BufferedLogger::new(config, sink.clone())),
            sink,
        )
    }

    fn service() -> RateLimitService {
        let (logger, _) = quiet_logger();
        RateLimitService::with_stores(
            Arc::new(FixedWindowStore::new()),
            Arc::new(SlidingWindowStore::new()),
            logger,
        )
    }

    // ── Fixed window store ───────────────────────────────────────────────

    #[test]
    fn test_fixed_window_counts_and_resets() {
        let store = FixedWindowStore::new();
        let t0 = 1_000_000;

        for expected in 1..=3 {
            let snap = store.hit("k", 60_000, t0 + expected).unwrap();
            assert_eq!(snap.total_hits, expected as u32);
        }

        // Past the window the entry is replaced, not incremented.
        let snap = store.hit("k", 60_000, t0 + 60_001).unwrap();
        assert_eq!(snap.total_hits, 1);
        assert_eq!(snap.reset_at_ms, t0 + 60_001 + 60_000);
    }

    #[test]
    fn test_fixed_window_reset_and_sweep() {
        let store = FixedWindowStore::new();
        store.hit("a", 1_000, 0).unwrap();
        store.hit("b", 1_000, 0).unwrap();

        store.reset("a");
        assert_eq!(store.hit("a", 1_000, 10).unwrap().total_hits, 1);

        store.sweep(5_000);
        assert_eq!(store.entries.lock().len(), 0);
        // A fresh hit after the sweep starts at 1.
        assert_eq!(store.hit("b", 1_000, 5_001).unwrap().total_hits, 1);
    }

    // ── Sliding window store ─────────────────────────────────────────────

    #[test]
    fn test_sliding_window_prunes_old_timestamps() {
        let store = SlidingWindowStore::new();

        // Three hits spread over the window.
        assert_eq!(store.hit("k", 10_000, 0).unwrap().total_hits, 1);
        assert_eq!(store.hit("k", 10_000, 4_000).unwrap().total_hits, 2);
        assert_eq!(store.hit("k", 10_000, 8_000).unwrap().total_hits, 3);

        // At t=11s the t=0 hit has aged out.
        let snap = store.hit("k", 10_000, 11_000).unwrap();
        assert_eq!(snap.total_hits, 3);
        assert_eq!(snap.reset_at_ms, 4_000 + 10_000);
    }

    #[test]
    fn test_sliding_window_fully_expired_starts_fresh() {
        let store = SlidingWindowStore::new();
        for i in 0..5 {
            store.hit("k", 1_000, i * 10).unwrap();
        }

        let snap = store.hit("k", 1_000, 10_000).unwrap();
        assert_eq!(snap.total_hits, 1);
    }

    #[test]
    fn test_sliding_window_sweep_drops_stale_keys() {
        let store = SlidingWindowStore::new();
        store.hit("old", 1_000, 0).unwrap();
        store.hit("new", 1_000, MAX_WINDOW_MS + 500).unwrap();

        store.sweep(MAX_WINDOW_MS + 1_000);
        let entries = store.entries.lock();
        assert!(!entries.contains_key("old"));
        assert!(entries.contains_key("new"));
    }

    // ── Decision function ────────────────────────────────────────────────

    #[test]
    fn test_search_quota_exhaustion_scenario() {
        let svc = service();
        let t0 = 1_700_000_000_000;

        // 31 calls within 10 seconds against the search class (30/min).
        let mut last_remaining = 30;
        for call in 0..30 {
            let decision = svc.evaluate_at("ip:10.0.0.1", RouteClass::Search, t0 + call * 300);
            assert!(decision.allowed, "call {} should be allowed", call + 1);
            assert_eq!(decision.remaining, 29 - call as u32);
            assert!(decision.remaining < last_remaining);
            last_remaining = decision.remaining;
        }

        let denied = svc.evaluate_at("ip:10.0.0.1", RouteClass::Search, t0 + 9_500);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.message.is_some());
        let reset = denied.reset_epoch_secs;
        assert!(reset >= t0 / 1000 && reset <= t0 / 1000 + 60);
    }

    #[test]
    fn test_window_elapse_restores_quota() {
        let svc = service();
        let t0 = 0;

        for i in 0..30 {
            svc.evaluate_at("ip:1.2.3.4", RouteClass::Search, t0 + i);
        }
        assert!(!svc.evaluate_at("ip:1.2.3.4", RouteClass::Search, t0 + 100).allowed);

        let fresh = svc.evaluate_at("ip:1.2.3.4", RouteClass::Search, t0 + 61_000);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 29);
    }

    #[test]
    fn test_auth_uses_sliding_window() {
        let svc = service();
        let t0 = 0;

        // Five auth attempts allowed, sixth denied.
        for i in 0..5 {
            assert!(svc.evaluate_at("ip:9.9.9.9", RouteClass::Auth, t0 + i * 1000).allowed);
        }
        assert!(!svc.evaluate_at("ip:9.9.9.9", RouteClass::Auth, t0 + 6_000).allowed);

        // Sliding: quota frees up only as individual attempts age out.
        assert!(!svc.evaluate_at("ip:9.9.9.9", RouteClass::Auth, t0 + 800_000).allowed);
        let fresh = svc.evaluate_at("ip:9.9.9.9", RouteClass::Auth, t0 + 2_000_000);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4);
    }

    #[test]
    fn test_allowlist_bypasses_counting() {
        let svc = service();

        for _ in 0..500 {
            let decision = svc.evaluate_at("ip:127.0.0.1", RouteClass::Auth, 0);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 5);
        }
    }

    #[test]
    fn test_custom_allowlist_entry() {
        let svc = service().with_allowlist(["user:health-probe".to_string()]);

        for _ in 0..100 {
            assert!(svc.evaluate_at("user:health-probe", RouteClass::Health, 0).allowed);
        }
    }

    #[test]
    fn test_classes_do_not_share_counters() {
        let svc = service();

        for i in 0..30 {
            svc.evaluate_at("ip:5.5.5.5", RouteClass::Search, i);
        }
        assert!(!svc.evaluate_at("ip:5.5.5.5", RouteClass::Search, 50).allowed);
        assert!(svc.evaluate_at("ip:5.5.5.5", RouteClass::Api, 50).allowed);
    }

    #[test]
    fn test_reset_identity_unblocks() {
        let svc = service();

        for i in 0..31 {
            svc.evaluate_at("ip:8.8.8.8", RouteClass::Search, i);
        }
        assert!(!svc.evaluate_at("ip:8.8.8.8", RouteClass::Search, 100).allowed);

        svc.reset_identity("ip:8.8.8.8");
        assert!(svc.evaluate_at("ip:8.8.8.8", RouteClass::Search, 101).allowed);
    }

    // ── Fail-open ────────────────────────────────────────────────────────

    struct BrokenStore;

    impl CounterStore for BrokenStore {
        fn hit(&self, _key: &str, _window_ms: u64, _now_ms: i64) -> Result<CounterSnapshot> {
            anyhow::bail!("store unreachable")
        }
        fn reset(&self, _key: &str) {}
        fn sweep(&self, _now_ms: i64) {}
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_with_one_error_log() {
        let (logger, sink) = quiet_logger();
        let svc = RateLimitService::with_stores(
            Arc::new(BrokenStore),
            Arc::new(BrokenStore),
            logger.clone(),
        );

        let decision = svc.evaluate_at("ip:2.2.2.2", RouteClass::Api, 0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 100);

        logger.flush_now().await;
        let entries: Vec<_> = sink.batches().concat();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_denial_logs_at_warn() {
        let (logger, sink) = quiet_logger();
        let svc = RateLimitService::with_stores(
            Arc::new(FixedWindowStore::new()),
            Arc::new(SlidingWindowStore::new()),
            logger.clone(),
        );

        for i in 0..31 {
            svc.evaluate_at("ip:3.3.3.3", RouteClass::Search, i);
        }

        logger.flush_now().await;
        let entries: Vec<_> = sink.batches().concat();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].category, crate::types::LogCategory::RateLimit);
    }

    // ── Identity & headers ───────────────────────────────────────────────

    #[test]
    fn test_request_identity_prefers_user() {
        assert_eq!(
            request_identity(Some("u-1"), Some("1.1.1.1"), Some("2.2.2.2")),
            "user:u-1"
        );
        assert_eq!(
            request_identity(None, Some("1.1.1.1, 10.0.0.1"), Some("2.2.2.2")),
            "ip:1.1.1.1"
        );
        assert_eq!(request_identity(None, None, Some("2.2.2.2")), "ip:2.2.2.2");
        assert_eq!(request_identity(None, None, None), "ip:unknown");
        assert_eq!(request_identity(None, Some("  "), None), "ip:unknown");
    }

    #[test]
    fn test_decision_headers() {
        let svc = service();
        let t0 = 1_700_000_000_000;

        let allowed = svc.evaluate_at("ip:4.4.4.4", RouteClass::Api, t0);
        let headers = allowed.headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], ("X-RateLimit-Limit", "100".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Remaining", "99".to_string()));

        for i in 0..100 {
            svc.evaluate_at("ip:6.6.6.6", RouteClass::Api, t0 + i);
        }
        let denied = svc.evaluate_at("ip:6.6.6.6", RouteClass::Api, t0 + 200);
        let headers = denied.headers();
        assert_eq!(headers.len(), 4);
        assert_eq!(headers[3].0, "Retry-After");
        let retry_after: i64 = headers[3].1.parse().unwrap();
        assert!(retry_after >= 0 && retry_after <= 60);
    }
}
