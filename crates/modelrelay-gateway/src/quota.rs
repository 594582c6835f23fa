//! Tier quota arbitration.
//!
//! Decides whether a caller may place a request right now, independent of
//! credential rotation.  Each caller tier receives a percentage share of
//! the organization-wide provider limit, but never less than a configured
//! floor — a low org limit must not starve a tier to zero usability.
//!
//! A separate organization-level check ([`QuotaService::should_use_fallback`])
//! watches total usage against a threshold and signals the orchestration
//! loop to prefer the fallback provider for new calls.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use modelrelay_store::{UsageKind, UsageStore, Window};

use crate::error::Result;

const SECONDS_PER_DAY: i64 = 86_400;

// ───────────────────────────────────────────────────────────────────────
// Tiers and limits
// ───────────────────────────────────────────────────────────────────────

/// Caller classification used to allocate a share of the shared limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Admin,
    User,
    Visitor,
}

impl Tier {
    /// Parse a role string; anything unrecognized is treated as a visitor.
    pub fn from_role(role: &str) -> Self {
        match role.to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "user" => Self::User,
            _ => Self::Visitor,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Visitor => "visitor",
        }
    }
}

/// The four rate dimensions an organization limit is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Requests per minute.
    pub rpm: u64,
    /// Requests per day.
    pub rpd: u64,
    /// Tokens per minute.
    pub tpm: u64,
    /// Tokens per day.
    pub tpd: u64,
}

/// Published organization limits for known provider/model pairs, with a
/// conservative fallback for anything unknown.
pub fn default_limits(provider: &str, model: &str) -> RateLimits {
    match (provider, model) {
        ("groq", "openai/gpt-oss-120b") => RateLimits {
            rpm: 1_000,
            rpd: 500_000,
            tpm: 250_000,
            tpd: 10_000_000,
        },
        ("groq", "llama-3.3-70b-versatile") => RateLimits {
            rpm: 1_000,
            rpd: 500_000,
            tpm: 300_000,
            tpd: 10_000_000,
        },
        ("groq", "playai-tts") | ("groq", "playai-tts-turbo") => RateLimits {
            rpm: 250,
            rpd: 100_000,
            tpm: 1_000_000,
            tpd: 10_000_000,
        },
        ("cerebras", "gpt-oss-120b") => RateLimits {
            rpm: 30,
            rpd: 14_400,
            tpm: 64_000,
            tpd: 1_000_000,
        },
        _ => RateLimits {
            rpm: 30,
            rpd: 1_000,
            tpm: 10_000,
            tpd: 100_000,
        },
    }
}

/// Minimum per-tier limits.  Floor values — a tier's effective limit can
/// never go below these, whatever the org limit works out to.
fn tier_floors(tier: Tier) -> RateLimits {
    match tier {
        Tier::Admin => RateLimits {
            rpm: 20,
            rpd: 500,
            tpm: 5_000,
            tpd: 100_000,
        },
        Tier::User => RateLimits {
            rpm: 10,
            rpd: 200,
            tpm: 3_000,
            tpd: 50_000,
        },
        Tier::Visitor => RateLimits {
            rpm: 5,
            rpd: 50,
            tpm: 2_000,
            tpd: 20_000,
        },
    }
}

// ───────────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────────

/// Per-tier hourly/session caps for the speech-synthesis request class.
#[derive(Debug, Clone)]
pub struct SpeechLimits {
    /// Share of the org speech quota admins may consume before an explicit
    /// denial (percent).
    pub admin_percent: u64,
    /// Org-wide share beyond which non-admin speech stops silently
    /// (percent).
    pub silent_percent: u64,
    pub admin_hourly: u64,
    pub user_hourly: u64,
    /// Cumulative cap per anonymous session.
    pub visitor_session: u64,
}

impl Default for SpeechLimits {
    fn default() -> Self {
        Self {
            admin_percent: 50,
            silent_percent: 90,
            admin_hourly: 100,
            user_hourly: 30,
            visitor_session: 10,
        }
    }
}

/// Quota configuration, constructed once at startup and injected.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Percentage of the org limit each tier receives.
    pub admin_percent: u64,
    pub user_percent: u64,
    pub visitor_percent: u64,

    /// Provider used when the primary is near its org-wide limit.
    pub fallback_provider: String,
    /// Org usage percentage beyond which fallback is preferred.
    pub fallback_threshold_percent: u64,

    /// Overrides for org limits, keyed by `(provider, model)`.
    pub limit_overrides: HashMap<(String, String), RateLimits>,

    pub speech: SpeechLimits,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            admin_percent: 50,
            user_percent: 10,
            visitor_percent: 5,
            fallback_provider: "cerebras".into(),
            fallback_threshold_percent: 80,
            limit_overrides: HashMap::new(),
            speech: SpeechLimits::default(),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl QuotaConfig {
    /// Read overrides from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            admin_percent: env_u64("RATE_LIMIT_ADMIN_PERCENT", defaults.admin_percent),
            user_percent: env_u64("RATE_LIMIT_USER_PERCENT", defaults.user_percent),
            visitor_percent: env_u64("RATE_LIMIT_VISITOR_PERCENT", defaults.visitor_percent),
            fallback_provider: std::env::var("RATE_LIMIT_FALLBACK_PROVIDER")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.fallback_provider),
            fallback_threshold_percent: env_u64(
                "RATE_LIMIT_FALLBACK_THRESHOLD",
                defaults.fallback_threshold_percent,
            ),
            limit_overrides: HashMap::new(),
            speech: SpeechLimits {
                admin_percent: env_u64("SPEECH_LIMIT_ADMIN_PERCENT", defaults.speech.admin_percent),
                silent_percent: env_u64("SPEECH_SILENT_STOP_PERCENT", defaults.speech.silent_percent),
                admin_hourly: env_u64("SPEECH_LIMIT_ADMIN_HOURLY", defaults.speech.admin_hourly),
                user_hourly: env_u64("SPEECH_LIMIT_USER_HOURLY", defaults.speech.user_hourly),
                visitor_session: env_u64(
                    "SPEECH_LIMIT_VISITOR_SESSION",
                    defaults.speech.visitor_session,
                ),
            },
        }
    }

    fn tier_percent(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Admin => self.admin_percent,
            Tier::User => self.user_percent,
            Tier::Visitor => self.visitor_percent,
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Decisions
// ───────────────────────────────────────────────────────────────────────

/// Usage against the effective limit in one dimension.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DimensionUsage {
    pub current: u64,
    pub limit: u64,
}

/// A structured denial: which dimension tripped, where the caller stands,
/// and when a retry could succeed.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDenial {
    /// `rate_limit_rpm` / `rate_limit_tpm` / `rate_limit_rpd` /
    /// `rate_limit_tpd`, or a speech-path reason.
    pub reason: String,
    pub limit: u64,
    pub current: u64,
    pub retry_after_secs: u64,
    pub tier: Tier,
    /// When true the capability should simply appear unavailable; no error
    /// is surfaced to the caller.  Never set for admins.
    pub silent: bool,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Serialize)]
pub enum QuotaDecision {
    Allowed {
        rpm: DimensionUsage,
        tpm: DimensionUsage,
        rpd: DimensionUsage,
        tpd: DimensionUsage,
    },
    Denied(QuotaDenial),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Outcome of the org-level fallback check.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackDecision {
    pub use_fallback: bool,
    pub fallback_provider: String,
    /// Highest usage percentage across the four dimensions.
    pub max_usage_percent: f64,
    pub reason: Option<String>,
}

// ───────────────────────────────────────────────────────────────────────
// Service
// ───────────────────────────────────────────────────────────────────────

/// Computes permitted call budgets from persisted usage counters.
#[derive(Clone)]
pub struct QuotaService {
    usage: UsageStore,
    config: QuotaConfig,
}

impl QuotaService {
    pub fn new(usage: UsageStore, config: QuotaConfig) -> Self {
        Self { usage, config }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Organization limits for a provider/model: config override first,
    /// then the built-in defaults.
    pub fn org_limits(&self, provider: &str, model: &str) -> RateLimits {
        self.config
            .limit_overrides
            .get(&(provider.to_owned(), model.to_owned()))
            .copied()
            .unwrap_or_else(|| default_limits(provider, model))
    }

    /// A tier's effective limits: its percentage share of the org limit,
    /// floored at the tier minimums.
    pub fn effective_limits(&self, tier: Tier, provider: &str, model: &str) -> RateLimits {
        let org = self.org_limits(provider, model);
        let percent = self.config.tier_percent(tier);
        let floors = tier_floors(tier);
        let share = |org_limit: u64, floor: u64| (org_limit * percent / 100).max(floor);
        RateLimits {
            rpm: share(org.rpm, floors.rpm),
            rpd: share(org.rpd, floors.rpd),
            tpm: share(org.tpm, floors.tpm),
            tpd: share(org.tpd, floors.tpd),
        }
    }

    /// May this caller place a request right now?
    pub async fn can_make_request(
        &self,
        caller: &str,
        tier: Tier,
        provider: &str,
        model: &str,
    ) -> Result<QuotaDecision> {
        self.can_make_request_at(caller, tier, provider, model, Utc::now())
            .await
    }

    /// [`Self::can_make_request`] evaluated at an explicit instant.
    ///
    /// Dimensions are checked in order — minute requests, minute tokens,
    /// day requests, day tokens — and the first violation short-circuits.
    pub async fn can_make_request_at(
        &self,
        caller: &str,
        tier: Tier,
        provider: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let limits = self.effective_limits(tier, provider, model);
        let minute = self
            .usage
            .caller_usage_at(caller, provider, model, Window::Minute, now)
            .await?;

        let deny = |reason: &str, limit: u64, current: u64, retry: u64| {
            debug!(caller, reason, limit, current, "quota denied");
            QuotaDecision::Denied(QuotaDenial {
                reason: reason.to_owned(),
                limit,
                current,
                retry_after_secs: retry,
                tier,
                silent: false,
            })
        };

        if minute.requests >= limits.rpm {
            return Ok(deny("rate_limit_rpm", limits.rpm, minute.requests, 60));
        }
        if minute.tokens >= limits.tpm {
            return Ok(deny("rate_limit_tpm", limits.tpm, minute.tokens, 60));
        }

        let day = self
            .usage
            .caller_usage_at(caller, provider, model, Window::Day, now)
            .await?;
        let to_midnight = (SECONDS_PER_DAY - now.timestamp().rem_euclid(SECONDS_PER_DAY)) as u64;

        if day.requests >= limits.rpd {
            return Ok(deny("rate_limit_rpd", limits.rpd, day.requests, to_midnight));
        }
        if day.tokens >= limits.tpd {
            return Ok(deny("rate_limit_tpd", limits.tpd, day.tokens, to_midnight));
        }

        Ok(QuotaDecision::Allowed {
            rpm: DimensionUsage {
                current: minute.requests,
                limit: limits.rpm,
            },
            tpm: DimensionUsage {
                current: minute.tokens,
                limit: limits.tpm,
            },
            rpd: DimensionUsage {
                current: day.requests,
                limit: limits.rpd,
            },
            tpd: DimensionUsage {
                current: day.tokens,
                limit: limits.tpd,
            },
        })
    }

    /// Should new calls prefer the fallback provider?  Looks only at
    /// organization-wide usage, never at any individual caller.
    pub async fn should_use_fallback(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<FallbackDecision> {
        self.should_use_fallback_at(provider, model, Utc::now()).await
    }

    /// [`Self::should_use_fallback`] evaluated at an explicit instant.
    pub async fn should_use_fallback_at(
        &self,
        provider: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<FallbackDecision> {
        let limits = self.org_limits(provider, model);
        let minute = self
            .usage
            .org_usage_at(provider, model, Window::Minute, now)
            .await?;
        let day = self
            .usage
            .org_usage_at(provider, model, Window::Day, now)
            .await?;

        let percent = |current: u64, limit: u64| {
            if limit == 0 {
                0.0
            } else {
                current as f64 / limit as f64 * 100.0
            }
        };
        let max_usage_percent = [
            percent(minute.requests, limits.rpm),
            percent(minute.tokens, limits.tpm),
            percent(day.requests, limits.rpd),
            percent(day.tokens, limits.tpd),
        ]
        .into_iter()
        .fold(0.0_f64, f64::max);

        let threshold = self.config.fallback_threshold_percent as f64;
        let use_fallback = max_usage_percent >= threshold;

        Ok(FallbackDecision {
            use_fallback,
            fallback_provider: self.config.fallback_provider.clone(),
            max_usage_percent,
            reason: use_fallback.then(|| {
                format!(
                    "usage at {max_usage_percent:.1}% of org limit (threshold {threshold:.0}%)"
                )
            }),
        })
    }

    /// May this caller place a speech-synthesis request right now?
    ///
    /// The org-wide ceiling is checked first: admins get an explicit denial
    /// at their configured share, everyone else gets a **silent** denial at
    /// the silent-stop share (the capability simply appears unavailable, so
    /// remaining quota is preserved without alarming anyone).  Below the
    /// ceiling, signed-in tiers have hourly caps and anonymous sessions a
    /// cumulative cap.
    pub async fn can_make_speech_request(
        &self,
        caller: &str,
        tier: Tier,
        provider: &str,
        model: &str,
    ) -> Result<QuotaDecision> {
        self.can_make_speech_request_at(caller, tier, provider, model, Utc::now())
            .await
    }

    /// [`Self::can_make_speech_request`] evaluated at an explicit instant.
    pub async fn can_make_speech_request_at(
        &self,
        caller: &str,
        tier: Tier,
        provider: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let limits = self.org_limits(provider, model);
        let speech = &self.config.speech;

        let threshold_percent = if tier == Tier::Admin {
            speech.admin_percent
        } else {
            speech.silent_percent
        };
        let rpm_ceiling = limits.rpm * threshold_percent / 100;
        let rpd_ceiling = limits.rpd * threshold_percent / 100;
        let silent = tier != Tier::Admin;

        let org_minute = self
            .usage
            .org_usage_at(provider, model, Window::Minute, now)
            .await?;
        if org_minute.requests >= rpm_ceiling {
            return Ok(QuotaDecision::Denied(QuotaDenial {
                reason: "org_rpm_threshold".into(),
                limit: rpm_ceiling,
                current: org_minute.requests,
                retry_after_secs: 60,
                tier,
                silent,
            }));
        }

        let org_day = self
            .usage
            .org_usage_at(provider, model, Window::Day, now)
            .await?;
        if org_day.requests >= rpd_ceiling {
            let to_midnight =
                (SECONDS_PER_DAY - now.timestamp().rem_euclid(SECONDS_PER_DAY)) as u64;
            return Ok(QuotaDecision::Denied(QuotaDenial {
                reason: "org_rpd_threshold".into(),
                limit: rpd_ceiling,
                current: org_day.requests,
                retry_after_secs: to_midnight,
                tier,
                silent,
            }));
        }

        match tier {
            Tier::Admin | Tier::User => {
                let hourly_limit = if tier == Tier::Admin {
                    speech.admin_hourly
                } else {
                    speech.user_hourly
                };
                let hour_count = self
                    .usage
                    .kind_count_at(caller, UsageKind::Speech, Window::Hour, now)
                    .await?;
                if hour_count >= hourly_limit {
                    return Ok(QuotaDecision::Denied(QuotaDenial {
                        reason: format!("{}_hourly_limit", tier.as_str()),
                        limit: hourly_limit,
                        current: hour_count,
                        retry_after_secs: 3_600,
                        tier,
                        silent: false,
                    }));
                }
                Ok(QuotaDecision::Allowed {
                    rpm: DimensionUsage {
                        current: hour_count,
                        limit: hourly_limit,
                    },
                    tpm: DimensionUsage { current: 0, limit: 0 },
                    rpd: DimensionUsage {
                        current: org_day.requests,
                        limit: rpd_ceiling,
                    },
                    tpd: DimensionUsage { current: 0, limit: 0 },
                })
            }

            Tier::Visitor => {
                let session_count = self
                    .usage
                    .kind_count_total(caller, UsageKind::Speech)
                    .await?;
                if session_count >= speech.visitor_session {
                    return Ok(QuotaDecision::Denied(QuotaDenial {
                        reason: "visitor_session_limit".into(),
                        limit: speech.visitor_session,
                        current: session_count,
                        retry_after_secs: 0,
                        tier,
                        silent: false,
                    }));
                }
                Ok(QuotaDecision::Allowed {
                    rpm: DimensionUsage {
                        current: session_count,
                        limit: speech.visitor_session,
                    },
                    tpm: DimensionUsage { current: 0, limit: 0 },
                    rpd: DimensionUsage {
                        current: org_day.requests,
                        limit: rpd_ceiling,
                    },
                    tpd: DimensionUsage { current: 0, limit: 0 },
                })
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────────
