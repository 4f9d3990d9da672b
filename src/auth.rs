//! Access control and rate limiting.
//!
//! Three tiers: `Public` (no key), `Registered`, `Premium`. Each
//! operation declares the minimum tier that may call it; the check runs
//! before any validation or storage work. Quotas are fixed-window
//! counters per caller identity, checked and incremented atomically
//! under one lock so concurrent requests cannot slip past the limit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{AuthConfig, RateLimitConfig};
use crate::error::{Error, Result};
use crate::models::ExtractionType;

/// Caller tiers, ordered. A higher tier may do everything a lower
/// tier can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Public,
    Registered,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Registered => "registered",
            Self::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "registered" => Some(Self::Registered),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

/// The operations the middleware gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SearchKnowledge,
    /// Listing stored extractions of one type.
    GetByType(ExtractionType),
    ListSources,
    CompareSources,
    /// Searching across all projects at once.
    CrossProjectSearch,
}

impl Operation {
    /// Minimum tier allowed to perform this operation.
    ///
    /// Raw reference lookups (decisions, patterns, warnings) are public;
    /// the synthesized views (methodologies, checklists, personas,
    /// workflows) and comparisons require registration; crossing project
    /// boundaries requires premium.
    pub fn required_tier(&self) -> Tier {
        match self {
            Self::SearchKnowledge | Self::ListSources => Tier::Public,
            Self::GetByType(t) => match t {
                ExtractionType::Decision | ExtractionType::Pattern | ExtractionType::Warning => {
                    Tier::Public
                }
                ExtractionType::Methodology
                | ExtractionType::Checklist
                | ExtractionType::Persona
                | ExtractionType::Workflow => Tier::Registered,
            },
            Self::CompareSources => Tier::Registered,
            Self::CrossProjectSearch => Tier::Premium,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchKnowledge => "search_knowledge",
            Self::GetByType(_) => "get_by_type",
            Self::ListSources => "list_sources",
            Self::CompareSources => "compare_sources",
            Self::CrossProjectSearch => "cross_project_search",
        }
    }
}

/// The resolved identity of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub tier: Tier,
    /// Rate-limit bucket key: the API key, or the client address for
    /// anonymous callers.
    pub bucket: String,
}

/// API key registry loaded from configuration.
#[derive(Debug)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, KeyRecord>,
}

#[derive(Debug)]
struct KeyRecord {
    tier: Tier,
    disabled: bool,
}

impl ApiKeyRegistry {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut keys = HashMap::with_capacity(config.keys.len());
        for entry in &config.keys {
            let tier = Tier::parse(&entry.tier).ok_or_else(|| {
                Error::Validation(format!("unknown tier '{}' in auth config", entry.tier))
            })?;
            if tier == Tier::Public {
                return Err(Error::Validation(
                    "API keys cannot be assigned the public tier".to_string(),
                ));
            }
            keys.insert(
                entry.key.clone(),
                KeyRecord {
                    tier,
                    disabled: entry.disabled,
                },
            );
        }
        Ok(Self { keys })
    }

    /// Resolve a request's credential to a caller identity.
    ///
    /// No key means an anonymous public caller. A key that is unknown
    /// or disabled is rejected outright rather than downgraded, so a
    /// revoked key never quietly keeps working at a lower tier.
    pub fn resolve(&self, api_key: Option<&str>, client_addr: &str) -> Result<Caller> {
        match api_key {
            None => Ok(Caller {
                tier: Tier::Public,
                bucket: format!("anon:{client_addr}"),
            }),
            Some(key) => {
                let record = self
                    .keys
                    .get(key)
                    .ok_or_else(|| Error::Unauthorized("unknown API key".to_string()))?;
                if record.disabled {
                    return Err(Error::Unauthorized("API key is disabled".to_string()));
                }
                Ok(Caller {
                    tier: record.tier,
                    bucket: format!("key:{key}"),
                })
            }
        }
    }
}

/// Fixed-window rate limiter.
///
/// Counters reset when the window elapses; there is no sliding credit.
/// Premium callers are not limited.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, WindowState>>,
}

struct WindowState {
    started: Instant,
    count: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn quota(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Public => Some(self.config.public_per_window),
            Tier::Registered => Some(self.config.registered_per_window),
            Tier::Premium => None,
        }
    }

    /// Count one request against the caller's bucket; errors with
    /// `RateLimited` and the time until reset when over quota.
    pub fn check(&self, caller: &Caller) -> Result<()> {
        let Some(quota) = self.quota(caller.tier) else {
            return Ok(());
        };

        let window = Duration::from_secs(self.config.window_secs);
        let now = Instant::now();

        let mut windows = self
            .windows
            .lock()
            .map_err(|_| Error::Internal("rate limiter lock poisoned".to_string()))?;

        let state = windows.entry(caller.bucket.clone()).or_insert(WindowState {
            started: now,
            count: 0,
        });

        if now.duration_since(state.started) >= window {
            state.started = now;
            state.count = 0;
        }

        if state.count >= quota {
            let retry_after = window.saturating_sub(now.duration_since(state.started));
            return Err(Error::RateLimited { retry_after });
        }

        state.count += 1;
        Ok(())
    }
}

/// The single authorization chokepoint: resolve the caller, check the
/// tier against the operation, then spend rate-limit quota. Runs before
/// any request validation or storage access.
pub struct AccessControl {
    registry: ApiKeyRegistry,
    limiter: RateLimiter,
}

impl AccessControl {
    pub fn new(auth: &AuthConfig, rate_limit: RateLimitConfig) -> Result<Self> {
        Ok(Self {
            registry: ApiKeyRegistry::from_config(auth)?,
            limiter: RateLimiter::new(rate_limit),
        })
    }

    pub fn authorize(
        &self,
        api_key: Option<&str>,
        client_addr: &str,
        operation: Operation,
    ) -> Result<Caller> {
        let caller = self.registry.resolve(api_key, client_addr)?;

        let required = operation.required_tier();
        if caller.tier < required {
            return Err(Error::Forbidden(format!(
                "{} requires the {} tier",
                operation.name(),
                required.as_str()
            )));
        }

        self.limiter.check(&caller)?;
        Ok(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyEntry;

    fn registry() -> ApiKeyRegistry {
        ApiKeyRegistry::from_config(&AuthConfig {
            keys: vec![
                ApiKeyEntry {
                    key: "reg-1".to_string(),
                    tier: "registered".to_string(),
                    disabled: false,
                },
                ApiKeyEntry {
                    key: "prem-1".to_string(),
                    tier: "premium".to_string(),
                    disabled: false,
                },
                ApiKeyEntry {
                    key: "dead-1".to_string(),
                    tier: "registered".to_string(),
                    disabled: true,
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Public < Tier::Registered);
        assert!(Tier::Registered < Tier::Premium);
    }

    #[test]
    fn test_operation_tiers() {
        assert_eq!(Operation::SearchKnowledge.required_tier(), Tier::Public);
        assert_eq!(
            Operation::GetByType(ExtractionType::Warning).required_tier(),
            Tier::Public
        );
        assert_eq!(
            Operation::GetByType(ExtractionType::Methodology).required_tier(),
            Tier::Registered
        );
        assert_eq!(Operation::CompareSources.required_tier(), Tier::Registered);
        assert_eq!(Operation::CrossProjectSearch.required_tier(), Tier::Premium);
    }

    #[test]
    fn test_resolve_identities() {
        let reg = registry();

        let anon = reg.resolve(None, "10.0.0.1").unwrap();
        assert_eq!(anon.tier, Tier::Public);
        assert_eq!(anon.bucket, "anon:10.0.0.1");

        let premium = reg.resolve(Some("prem-1"), "10.0.0.1").unwrap();
        assert_eq!(premium.tier, Tier::Premium);

        let unknown = reg.resolve(Some("nope"), "10.0.0.1").unwrap_err();
        assert_eq!(unknown.code(), "UNAUTHORIZED");

        let disabled = reg.resolve(Some("dead-1"), "10.0.0.1").unwrap_err();
        assert_eq!(disabled.code(), "UNAUTHORIZED");
    }

    #[test]
    fn test_forbidden_before_rate_limit() {
        let access = AccessControl::new(
            &AuthConfig { keys: vec![] },
            RateLimitConfig {
                public_per_window: 0,
                registered_per_window: 0,
                window_secs: 60,
            },
        )
        .unwrap();

        // Tier check fires first even with a zero quota.
        let err = access
            .authorize(None, "10.0.0.1", Operation::CompareSources)
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn test_rate_limit_boundary() {
        let limiter = RateLimiter::new(RateLimitConfig {
            public_per_window: 3,
            registered_per_window: 10,
            window_secs: 3600,
        });
        let caller = Caller {
            tier: Tier::Public,
            bucket: "anon:10.0.0.1".to_string(),
        };

        for _ in 0..3 {
            limiter.check(&caller).unwrap();
        }
        let err = limiter.check(&caller).unwrap_err();
        match err {
            Error::RateLimited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(3600));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // A different bucket has its own counter.
        let other = Caller {
            tier: Tier::Public,
            bucket: "anon:10.0.0.2".to_string(),
        };
        limiter.check(&other).unwrap();
    }

    #[test]
    fn test_premium_unlimited() {
        let limiter = RateLimiter::new(RateLimitConfig {
            public_per_window: 1,
            registered_per_window: 1,
            window_secs: 3600,
        });
        let caller = Caller {
            tier: Tier::Premium,
            bucket: "key:prem-1".to_string(),
        };
        for _ in 0..100 {
            limiter.check(&caller).unwrap();
        }
    }

    #[test]
    fn test_public_tier_keys_rejected() {
        let err = ApiKeyRegistry::from_config(&AuthConfig {
            keys: vec![ApiKeyEntry {
                key: "k".to_string(),
                tier: "public".to_string(),
                disabled: false,
            }],
        })
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
