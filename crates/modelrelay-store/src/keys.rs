//! Credential pool with rotation on rate limits.
//!
//! Rotation order is deterministic: the lowest-id active key whose rate
//! limit window has passed is always chosen, so first-added keys are
//! preferred and the audit trail stays readable.  When every pooled key is
//! cooling down the selection methods return `None`, which callers treat as
//! "fall back to the environment-configured credential".

use chrono::Utc;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Default cool-down applied when a provider signals a rate limit.
pub const DEFAULT_COOLDOWN_SECS: i64 = 60;

// ───────────────────────────────────────────────────────────────────────
// Rows
// ───────────────────────────────────────────────────────────────────────

/// Billing tier of a pooled credential, used only for limit display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTier {
    Basic,
    Production,
}

impl KeyTier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Production => "production",
        }
    }

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "basic" => Ok(Self::Basic),
            "production" => Ok(Self::Production),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown key tier: {other}"
            ))),
        }
    }
}

/// A single row from the `provider_keys` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKey {
    pub id: i64,
    pub provider: String,
    pub key_name: Option<String>,
    pub api_key: String,
    pub tier: KeyTier,
    pub is_default: bool,
    pub is_active: bool,
    /// Epoch seconds after which the key may be used again; `None` when the
    /// key is not cooling down.
    pub rate_limit_reset_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub error_count: u32,
    pub created_at: i64,
}

/// Fields for inserting a new key.
#[derive(Debug, Clone)]
pub struct NewProviderKey {
    pub provider: String,
    pub api_key: String,
    pub key_name: Option<String>,
    pub tier: KeyTier,
    pub is_default: bool,
    pub is_active: bool,
}

impl NewProviderKey {
    /// A basic-tier active key with no display name.
    pub fn new(provider: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            key_name: None,
            tier: KeyTier::Basic,
            is_default: false,
            is_active: true,
        }
    }
}

/// Partial update for an existing key (admin surface).
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub api_key: Option<String>,
    pub key_name: Option<String>,
    pub tier: Option<KeyTier>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
}

/// Request/token ceilings associated with a key tier, for admin display.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct KeyTierLimits {
    pub rpm: u64,
    pub rpd: u64,
    pub tpm: u64,
    pub tpd: u64,
}

/// Published per-tier limits for known providers.  Unknown combinations get
/// the most conservative row.
pub fn tier_limits(provider: &str, tier: KeyTier) -> KeyTierLimits {
    match (provider, tier) {
        ("groq", KeyTier::Basic) => KeyTierLimits {
            rpm: 30,
            rpd: 14_400,
            tpm: 6_000,
            tpd: 500_000,
        },
        ("groq", KeyTier::Production) => KeyTierLimits {
            rpm: 1_000,
            rpd: 1_440_000,
            tpm: 1_000_000,
            tpd: 2_000_000_000,
        },
        ("cerebras", KeyTier::Basic) => KeyTierLimits {
            rpm: 30,
            rpd: 1_000,
            tpm: 60_000,
            tpd: 1_000_000,
        },
        ("cerebras", KeyTier::Production) => KeyTierLimits {
            rpm: 30,
            rpd: 14_400,
            tpm: 64_000,
            tpd: 1_000_000,
        },
        _ => KeyTierLimits {
            rpm: 30,
            rpd: 1_000,
            tpm: 6_000,
            tpd: 500_000,
        },
    }
}

/// Mask an API key for display: first 8 and last 4 characters visible.
pub fn mask_key(key: &str) -> String {
    let len = key.chars().count();
    if len <= 12 {
        return "*".repeat(len);
    }
    let head: String = key.chars().take(8).collect();
    let tail: String = key.chars().skip(len - 4).collect();
    format!("{head}{}{tail}", "*".repeat(len - 12))
}

// ───────────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────────

const KEY_COLUMNS: &str = "id, provider, key_name, api_key, tier, is_default, is_active, \
     rate_limit_reset_at, last_used_at, last_error_at, error_count, created_at";

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderKey> {
    let tier_str: String = row.get(4)?;
    let tier = KeyTier::from_str(&tier_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ProviderKey {
        id: row.get(0)?,
        provider: row.get(1)?,
        key_name: row.get(2)?,
        api_key: row.get(3)?,
        tier,
        is_default: row.get(5)?,
        is_active: row.get(6)?,
        rate_limit_reset_at: row.get(7)?,
        last_used_at: row.get(8)?,
        last_error_at: row.get(9)?,
        error_count: row.get(10)?,
        created_at: row.get(11)?,
    })
}

/// CRUD and rotation operations on the `provider_keys` table.
#[derive(Clone)]
pub struct KeyStore {
    db: Database,
}

impl KeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── selection ────────────────────────────────────────────────────

    /// First available key across **all** providers: lowest id, active, and
    /// not cooling down.  `None` means every pooled key is unusable right now.
    #[instrument(skip(self))]
    pub async fn first_available(&self) -> StoreResult<Option<ProviderKey>> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM provider_keys \
                     WHERE is_active = 1 \
                       AND (rate_limit_reset_at IS NULL OR rate_limit_reset_at <= ?1) \
                     ORDER BY id ASC LIMIT 1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let row = stmt
                    .query_row([now], key_from_row)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(row)
            })
            .await
    }

    /// First available key for a single provider.
    #[instrument(skip(self))]
    pub async fn first_available_for(&self, provider: &str) -> StoreResult<Option<ProviderKey>> {
        let provider = provider.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM provider_keys \
                     WHERE provider = ?1 AND is_active = 1 \
                       AND (rate_limit_reset_at IS NULL OR rate_limit_reset_at <= ?2) \
                     ORDER BY id ASC LIMIT 1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let row = stmt
                    .query_row(rusqlite::params![provider, now], key_from_row)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(row)
            })
            .await
    }

    /// Next available key with `id > after_id`, used after the current key
    /// just hit a rate limit.  `None` means fall back to the environment
    /// credential.
    #[instrument(skip(self))]
    pub async fn next_available_after(&self, after_id: i64) -> StoreResult<Option<ProviderKey>> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM provider_keys \
                     WHERE id > ?1 AND is_active = 1 \
                       AND (rate_limit_reset_at IS NULL OR rate_limit_reset_at <= ?2) \
                     ORDER BY id ASC LIMIT 1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let row = stmt
                    .query_row(rusqlite::params![after_id, now], key_from_row)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(row)
            })
            .await
    }

    // ── outcome bookkeeping ──────────────────────────────────────────

    /// Mark a key rate-limited for `cooldown_secs` from now.
    ///
    /// Single-statement UPDATE: the increment happens in SQL, so concurrent
    /// calls never lose writes, and re-marking with the same or a later
    /// reset time is harmless.
    pub async fn mark_rate_limited(&self, id: i64, cooldown_secs: i64) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        self.mark_rate_limited_until(id, now + cooldown_secs).await
    }

    /// Mark a key rate-limited until an explicit epoch timestamp.
    pub async fn mark_rate_limited_until(&self, id: i64, reset_at: i64) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        debug!(key_id = id, reset_at, "marking key rate-limited");
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE provider_keys \
                     SET rate_limit_reset_at = ?1, last_error_at = ?2, error_count = error_count + 1 \
                     WHERE id = ?3",
                    rusqlite::params![reset_at, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Record a successful call: stamps `last_used_at` and resets
    /// `error_count`.
    pub async fn mark_used(&self, id: i64) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE provider_keys SET last_used_at = ?1, error_count = 0 WHERE id = ?2",
                    rusqlite::params![now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Clear a key's cool-down manually (admin action).
    pub async fn clear_rate_limit(&self, id: i64) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE provider_keys SET rate_limit_reset_at = NULL WHERE id = ?1",
                    [id],
                )?;
                Ok(())
            })
            .await
    }

    // ── admin CRUD ───────────────────────────────────────────────────

    /// Insert a new key, returning its id.  Marking a key as the provider
    /// default unsets the flag on the provider's other keys.
    #[instrument(skip(self, new), fields(provider = %new.provider))]
    pub async fn add_key(&self, new: NewProviderKey) -> StoreResult<i64> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                if new.is_default {
                    conn.execute(
                        "UPDATE provider_keys SET is_default = 0 WHERE provider = ?1",
                        [&new.provider],
                    )?;
                }
                conn.execute(
                    "INSERT INTO provider_keys \
                     (provider, api_key, key_name, tier, is_default, is_active, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        new.provider,
                        new.api_key,
                        new.key_name,
                        new.tier.as_str(),
                        new.is_default,
                        new.is_active,
                        now
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Apply a partial update.  Returns `false` when the key does not exist
    /// or the patch is empty.
    pub async fn update_key(&self, id: i64, patch: KeyPatch) -> StoreResult<bool> {
        self.db
            .execute(move |conn| {
                let provider: Option<String> = conn
                    .query_row("SELECT provider FROM provider_keys WHERE id = ?1", [id], |r| {
                        r.get(0)
                    })
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(provider) = provider else {
                    return Ok(false);
                };

                if patch.is_default == Some(true) {
                    conn.execute(
                        "UPDATE provider_keys SET is_default = 0 WHERE provider = ?1",
                        [&provider],
                    )?;
                }

                let mut sets: Vec<&str> = Vec::new();
                let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
                if let Some(api_key) = patch.api_key {
                    sets.push("api_key = ?");
                    values.push(Box::new(api_key));
                }
                if let Some(key_name) = patch.key_name {
                    sets.push("key_name = ?");
                    values.push(Box::new(key_name));
                }
                if let Some(tier) = patch.tier {
                    sets.push("tier = ?");
                    values.push(Box::new(tier.as_str().to_string()));
                }
                if let Some(is_default) = patch.is_default {
                    sets.push("is_default = ?");
                    values.push(Box::new(is_default));
                }
                if let Some(is_active) = patch.is_active {
                    sets.push("is_active = ?");
                    values.push(Box::new(is_active));
                }
                if sets.is_empty() {
                    return Ok(false);
                }

                values.push(Box::new(id));
                let sql = format!(
                    "UPDATE provider_keys SET {} WHERE id = ?",
                    sets.join(", ")
                );
                let updated = conn.execute(
                    &sql,
                    rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Delete a key.  Keys are never deleted automatically; this is an
    /// admin action.
    pub async fn delete_key(&self, id: i64) -> StoreResult<bool> {
        self.db
            .execute(move |conn| {
                let deleted = conn.execute("DELETE FROM provider_keys WHERE id = ?1", [id])?;
                Ok(deleted > 0)
            })
            .await
    }

    /// Fetch a key by id.
    pub async fn get(&self, id: i64) -> StoreResult<ProviderKey> {
        self.db
            .execute(move |conn| {
                let sql = format!("SELECT {KEY_COLUMNS} FROM provider_keys WHERE id = ?1");
                conn.query_row(&sql, [id], key_from_row)
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                            entity: "provider_key",
                            id: id.to_string(),
                        },
                        other => StoreError::from(other),
                    })
            })
            .await
    }

    /// All keys for one provider, ordered by id (admin listing).
    pub async fn keys_for_provider(&self, provider: &str) -> StoreResult<Vec<ProviderKey>> {
        let provider = provider.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM provider_keys WHERE provider = ?1 ORDER BY id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([&provider], key_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// All keys across providers (admin listing).
    pub async fn all_keys(&self) -> StoreResult<Vec<ProviderKey>> {
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {KEY_COLUMNS} FROM provider_keys ORDER BY provider ASC, id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], key_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
