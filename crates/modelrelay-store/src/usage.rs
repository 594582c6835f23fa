//! Aggregated usage counters.
//!
//! Every completed call lands in the `api_usage` table, keyed by
//! `(caller, provider, model, kind, day, minute_bucket)`.  Writes are
//! single-statement UPSERTs with in-SQL increments, so two requests
//! reporting the same bucket concurrently never lose counts.  Reads roll
//! the buckets up into per-caller or organization-wide totals for a
//! minute / hour / day window.
//!
//! Time-sensitive operations take an explicit `at` timestamp in their `_at`
//! variants; the plain variants use the current UTC time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::Database;
use crate::error::StoreResult;

/// Default retention for usage rows, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

// ───────────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────────

/// The request class a usage row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// A chat/tool-calling model turn.
    Chat,
    /// A one-shot speech-synthesis request.
    Speech,
}

impl UsageKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Speech => "speech",
        }
    }
}

/// One completed call, ready to be folded into the counters.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    /// Caller identity: a user id, or a session id for anonymous callers.
    pub caller: String,
    /// Caller tier at record time (`admin` / `user` / `visitor`).
    pub role: String,
    pub provider: String,
    pub model: String,
    pub kind: UsageKind,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Whether the call went to the fallback provider.
    pub fallback_used: bool,
    pub latency_ms: u64,
}

impl UsageEvent {
    /// A chat event with zero token counts; builder-style setters fill the
    /// rest.
    pub fn chat(
        caller: impl Into<String>,
        role: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            caller: caller.into(),
            role: role.into(),
            provider: provider.into(),
            model: model.into(),
            kind: UsageKind::Chat,
            prompt_tokens: 0,
            completion_tokens: 0,
            fallback_used: false,
            latency_ms: 0,
        }
    }

    pub fn with_tokens(mut self, prompt: u64, completion: u64) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self
    }

    pub fn with_kind(mut self, kind: UsageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_fallback(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Rolled-up totals for one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub tokens: u64,
}

/// Query window for usage roll-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

fn day_string(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

// ───────────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────────

/// Reads and atomic-increment writes on the `api_usage` table.
#[derive(Clone)]
pub struct UsageStore {
    db: Database,
}

impl UsageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fold a completed call into the counters at the current time.
    pub async fn record(&self, event: UsageEvent) -> StoreResult<()> {
        self.record_at(event, Utc::now()).await
    }

    /// Fold a completed call into the counters at an explicit time.
    #[instrument(skip(self, event), fields(caller = %event.caller, provider = %event.provider))]
    pub async fn record_at(&self, event: UsageEvent, at: DateTime<Utc>) -> StoreResult<()> {
        let day = day_string(at);
        let bucket = minute_bucket(at);
        let tokens = event.prompt_tokens + event.completion_tokens;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO api_usage \
                     (caller, role, provider, model, kind, day, minute_bucket, \
                      request_count, token_count, fallback_count, latency_ms_total) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10) \
                     ON CONFLICT(caller, provider, model, kind, day, minute_bucket) DO UPDATE SET \
                       request_count    = request_count + 1, \
                       token_count      = token_count + excluded.token_count, \
                       fallback_count   = fallback_count + excluded.fallback_count, \
                       latency_ms_total = latency_ms_total + excluded.latency_ms_total, \
                       role             = excluded.role",
                    rusqlite::params![
                        event.caller,
                        event.role,
                        event.provider,
                        event.model,
                        event.kind.as_str(),
                        day,
                        bucket,
                        tokens as i64,
                        i64::from(event.fallback_used),
                        event.latency_ms as i64,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// One caller's usage for a provider/model within a window, ending now.
    pub async fn caller_usage(
        &self,
        caller: &str,
        provider: &str,
        model: &str,
        window: Window,
    ) -> StoreResult<UsageTotals> {
        self.caller_usage_at(caller, provider, model, window, Utc::now())
            .await
    }

    /// One caller's usage within a window ending at `at`.
    pub async fn caller_usage_at(
        &self,
        caller: &str,
        provider: &str,
        model: &str,
        window: Window,
        at: DateTime<Utc>,
    ) -> StoreResult<UsageTotals> {
        self.rollup(Some(caller.to_string()), provider.to_string(), model.to_string(), window, at)
            .await
    }

    /// Organization-wide usage (all callers) within a window ending now.
    pub async fn org_usage(
        &self,
        provider: &str,
        model: &str,
        window: Window,
    ) -> StoreResult<UsageTotals> {
        self.org_usage_at(provider, model, window, Utc::now()).await
    }

    /// Organization-wide usage within a window ending at `at`.
    pub async fn org_usage_at(
        &self,
        provider: &str,
        model: &str,
        window: Window,
        at: DateTime<Utc>,
    ) -> StoreResult<UsageTotals> {
        self.rollup(None, provider.to_string(), model.to_string(), window, at)
            .await
    }

    async fn rollup(
        &self,
        caller: Option<String>,
        provider: String,
        model: String,
        window: Window,
        at: DateTime<Utc>,
    ) -> StoreResult<UsageTotals> {
        let bucket = minute_bucket(at);
        let day = day_string(at);
        self.db
            .execute(move |conn| {
                // Build the WHERE clause and bind values together so the
                // positional parameters always line up.
                let mut clauses = vec!["provider = ?", "model = ?"];
                let mut binds: Vec<Box<dyn rusqlite::types::ToSql>> =
                    vec![Box::new(provider), Box::new(model)];

                match window {
                    Window::Minute => {
                        clauses.push("minute_bucket = ?");
                        binds.push(Box::new(bucket));
                    }
                    Window::Hour => {
                        clauses.push("minute_bucket > ? AND minute_bucket <= ?");
                        binds.push(Box::new(bucket - 60));
                        binds.push(Box::new(bucket));
                    }
                    Window::Day => {
                        clauses.push("day = ?");
                        binds.push(Box::new(day));
                    }
                }
                if let Some(caller) = caller {
                    clauses.push("caller = ?");
                    binds.push(Box::new(caller));
                }

                let sql = format!(
                    "SELECT COALESCE(SUM(request_count), 0), COALESCE(SUM(token_count), 0) \
                     FROM api_usage WHERE {}",
                    clauses.join(" AND ")
                );
                let (requests, tokens): (i64, i64) = conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(binds.iter().map(|v| v.as_ref())),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;

                Ok(UsageTotals {
                    requests: requests.max(0) as u64,
                    tokens: tokens.max(0) as u64,
                })
            })
            .await
    }

    /// Request count of one kind for a caller within a window ending at `at`.
    /// Used by the speech quota path (hourly caps for signed-in tiers).
    pub async fn kind_count_at(
        &self,
        caller: &str,
        kind: UsageKind,
        window: Window,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let caller = caller.to_string();
        let kind_str = kind.as_str();
        let bucket = minute_bucket(at);
        let day = day_string(at);
        self.db
            .execute(move |conn| {
                let mut clauses = vec!["caller = ?", "kind = ?"];
                let mut binds: Vec<Box<dyn rusqlite::types::ToSql>> =
                    vec![Box::new(caller), Box::new(kind_str.to_string())];

                match window {
                    Window::Minute => {
                        clauses.push("minute_bucket = ?");
                        binds.push(Box::new(bucket));
                    }
                    Window::Hour => {
                        clauses.push("minute_bucket > ? AND minute_bucket <= ?");
                        binds.push(Box::new(bucket - 60));
                        binds.push(Box::new(bucket));
                    }
                    Window::Day => {
                        clauses.push("day = ?");
                        binds.push(Box::new(day));
                    }
                }

                let sql = format!(
                    "SELECT COALESCE(SUM(request_count), 0) FROM api_usage WHERE {}",
                    clauses.join(" AND ")
                );
                let count: i64 = conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(binds.iter().map(|v| v.as_ref())),
                    |r| r.get(0),
                )?;
                Ok(count.max(0) as u64)
            })
            .await
    }

    /// Cumulative request count of one kind for a caller across all time.
    /// Used by the visitor per-session speech cap.
    pub async fn kind_count_total(&self, caller: &str, kind: UsageKind) -> StoreResult<u64> {
        let caller = caller.to_string();
        let kind_str = kind.as_str();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(request_count), 0) FROM api_usage \
                     WHERE caller = ?1 AND kind = ?2",
                    rusqlite::params![caller, kind_str],
                    |r| r.get(0),
                )?;
                Ok(count.max(0) as u64)
            })
            .await
    }

    /// Delete rows older than `days_to_keep` days.  Returns the number of
    /// rows removed.
    #[instrument(skip(self))]
    pub async fn prune(&self, days_to_keep: i64) -> StoreResult<usize> {
        let cutoff = day_string(Utc::now() - chrono::Duration::days(days_to_keep));
        self.db
            .execute(move |conn| {
                let deleted = conn.execute("DELETE FROM api_usage WHERE day < ?1", [&cutoff])?;
                Ok(deleted)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
