//! # modelrelay-store
//!
//! Persistence layer for the ModelRelay gateway.
//!
//! Two row families live here, both on SQLite with WAL mode:
//!
//! - **Credential pool** ([`KeyStore`]) — provider API keys with
//!   deterministic lowest-id-first rotation and per-key rate-limit state.
//! - **Usage counters** ([`UsageStore`]) — per-minute-bucket request/token
//!   aggregates consumed by the quota service.
//!
//! All writes that race across concurrent requests are single-statement
//! atomic updates or UPSERTs; there is no read-modify-write gap.
//!
//! ## Quick start
//!
//! ```ignore
//! use modelrelay_store::{Database, KeyStore, UsageStore};
//!
//! let db = Database::open_and_migrate("data/relay.db").await?;
//! let keys = KeyStore::new(db.clone());
//! let usage = UsageStore::new(db);
//! ```

pub mod db;
pub mod error;
pub mod keys;
pub mod migration;
pub mod usage;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use keys::{
    DEFAULT_COOLDOWN_SECS, KeyPatch, KeyStore, KeyTier, KeyTierLimits, NewProviderKey,
    ProviderKey, mask_key, tier_limits,
};
pub use usage::{
    DEFAULT_RETENTION_DAYS, UsageEvent, UsageKind, UsageStore, UsageTotals, Window,
};
