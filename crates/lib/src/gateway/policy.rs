//! Policy layer: origin check, bearer-token auth, fixed-window rate limiting.
//!
//! Every inbound command passes through [`PolicyLayer::admit`] before it is parsed or dispatched,
//! whichever transport it arrived on. Checks run cheapest first: origin, then token, then the
//! rate window. Only the rate windows are mutated here.

use crate::config::Config;
use crate::gateway::command::ErrorInfo;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

/// `Ok(())` admits the command; `Err` carries the denial to report back.
pub type Admission = Result<(), ErrorInfo>;

const RATE_SHARDS: usize = 16;

/// What the policy layer needs to know about one inbound command or handshake.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// Rate-limit key (remote address).
    pub client_key: &'a str,
    /// Bearer token presented by the caller, if any.
    pub token: Option<&'a str>,
    /// `Origin` header, if the caller is a browser.
    pub origin: Option<&'a str>,
}

/// Shared policy for both transports. Cheap to share behind an `Arc`.
pub struct PolicyLayer {
    origins: OriginPolicy,
    required_token: Option<String>,
    limiter: RateLimiter,
}

impl PolicyLayer {
    pub fn new(origins: OriginPolicy, required_token: Option<String>, limiter: RateLimiter) -> Self {
        Self {
            origins,
            required_token,
            limiter,
        }
    }

    /// Build from config; the token comes from [`crate::config::required_token`].
    pub fn from_config(config: &Config) -> Self {
        let gateway = &config.gateway;
        Self::new(
            OriginPolicy::new(gateway.allowed_origins.iter().map(String::as_str)),
            crate::config::required_token(config),
            RateLimiter::new(
                Duration::from_millis(gateway.rate_limit.window_ms),
                gateway.rate_limit.max_requests,
            ),
        )
    }

    /// Full admission: origin, then auth, then one rate-limit hit.
    pub fn admit(&self, request: &AdmissionRequest<'_>, now: Instant) -> Admission {
        self.check_origin(request.origin)?;
        self.authenticate(request.token)?;
        self.check_rate(request.client_key, now)
    }

    pub fn check_origin(&self, origin: Option<&str>) -> Admission {
        if self.origins.allows(origin) {
            Ok(())
        } else {
            Err(ErrorInfo::bad_input(format!(
                "origin not allowed: {}",
                origin.unwrap_or("")
            )))
        }
    }

    /// Pass-through when auth is disabled.
    pub fn authenticate(&self, token: Option<&str>) -> Admission {
        let Some(required) = self.required_token.as_deref() else {
            return Ok(());
        };
        let provided = token.map(str::trim).unwrap_or("");
        if provided.is_empty() {
            return Err(ErrorInfo::unauthorized("unauthorized: gateway token missing"));
        }
        if !constant_time_eq(provided.as_bytes(), required.as_bytes()) {
            return Err(ErrorInfo::unauthorized("unauthorized: gateway token mismatch"));
        }
        Ok(())
    }

    /// Per-frame limiting on streaming connections uses this alone.
    pub fn check_rate(&self, client_key: &str, now: Instant) -> Admission {
        self.limiter.check(client_key, now)
    }

    pub fn auth_enabled(&self) -> bool {
        self.required_token.is_some()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

/// Compares every byte of equal-length inputs; never short-circuits on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Allowed browser origins. Empty set admits everything; requests without an origin are not browsers and pass.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    pub fn new<'a>(origins: impl IntoIterator<Item = &'a str>) -> Self {
        let allowed = origins
            .into_iter()
            .map(normalize_origin)
            .filter(|o| !o.is_empty())
            .collect();
        Self { allowed }
    }

    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed.is_empty() => true,
            Some(o) => self.allowed.contains(&normalize_origin(o)),
        }
    }

    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Counter state for one client key.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Fixed-window limiter keyed per client, sharded so unrelated clients rarely contend.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    shards: Vec<Mutex<HashMap<String, RateWindow>>>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            shards: (0..RATE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn enabled(&self) -> bool {
        self.max_requests > 0
    }

    /// Record one hit for `key`. Over-limit hits are still counted and the window is kept.
    pub fn check(&self, key: &str, now: Instant) -> Admission {
        if !self.enabled() {
            return Ok(());
        }
        let mut shard = self.shard(key);
        let count = match shard.get_mut(key) {
            Some(w) if now < w.window_start + self.window => {
                w.count = w.count.saturating_add(1);
                w.count
            }
            Some(w) => {
                w.window_start = now;
                w.count = 1;
                1
            }
            None => {
                shard.insert(
                    key.to_string(),
                    RateWindow {
                        window_start: now,
                        count: 1,
                    },
                );
                1
            }
        };
        if count > self.max_requests {
            log::debug!("rate limit exceeded for {} ({} in window)", key, count);
            return Err(ErrorInfo::rate_limited(format!(
                "rate limit exceeded: {} requests per {} ms",
                self.max_requests,
                self.window.as_millis()
            )));
        }
        Ok(())
    }

    /// Drop windows that ended at least one full window ago; returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let horizon = self.window * 2;
        let mut removed = 0;
        for shard in &self.shards {
            let mut g = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = g.len();
            g.retain(|_, w| now.saturating_duration_since(w.window_start) < horizon);
            removed += before - g.len();
        }
        removed
    }

    /// Number of tracked client keys.
    pub fn tracked(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, RateWindow>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }
}
