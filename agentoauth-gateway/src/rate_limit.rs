//! Request rate limiting
//!
//! Two bands enforced before policy evaluation:
//! - per-IP sliding windows (requests per minute and per hour)
//! - per-tenant daily and monthly quotas, aligned to UTC boundaries
//!
//! Counters live in process memory; the CDN front pins a client to an edge,
//! so per-instance enforcement bounds each origin independently.

use agentoauth_core::Period;
use agentoauth_state::period;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Outcome of a rate-limit check, carried into `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy)]
pub struct RateStatus {
    pub allowed: bool,
    /// The band that decided (requests per minute or per hour)
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the limiting window frees a slot
    pub reset_secs: u64,
}

#[derive(Default)]
struct IpWindow {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl IpWindow {
    fn prune(&mut self, now: Instant) {
        while self.minute.front().is_some_and(|t| now.duration_since(*t) >= MINUTE) {
            self.minute.pop_front();
        }
        while self.hour.front().is_some_and(|t| now.duration_since(*t) >= HOUR) {
            self.hour.pop_front();
        }
    }
}

/// Sliding-window limiter keyed by client address
pub struct IpRateLimiter {
    minute_limit: u64,
    hour_limit: u64,
    windows: Mutex<HashMap<String, IpWindow>>,
}

impl IpRateLimiter {
    pub fn new(minute_limit: u64, hour_limit: u64) -> Self {
        Self {
            minute_limit,
            hour_limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record one request from `ip`
    pub fn check(&self, ip: &str) -> RateStatus {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(ip.to_string()).or_default();
        window.prune(now);

        if window.minute.len() as u64 >= self.minute_limit {
            let reset = window
                .minute
                .front()
                .map(|t| MINUTE.saturating_sub(now.duration_since(*t)).as_secs() + 1)
                .unwrap_or(60);
            return RateStatus {
                allowed: false,
                limit: self.minute_limit,
                remaining: 0,
                reset_secs: reset,
            };
        }
        if window.hour.len() as u64 >= self.hour_limit {
            let reset = window
                .hour
                .front()
                .map(|t| HOUR.saturating_sub(now.duration_since(*t)).as_secs() + 1)
                .unwrap_or(3600);
            return RateStatus {
                allowed: false,
                limit: self.hour_limit,
                remaining: 0,
                reset_secs: reset,
            };
        }

        window.minute.push_back(now);
        window.hour.push_back(now);

        RateStatus {
            allowed: true,
            limit: self.minute_limit,
            remaining: self.minute_limit - window.minute.len() as u64,
            reset_secs: 60,
        }
    }
}

/// Per-tenant quota ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TenantQuotas {
    pub daily: u64,
    pub monthly: u64,
}

#[derive(Default)]
struct UsageWindow {
    day_id: String,
    day_count: u64,
    month_id: String,
    month_count: u64,
}

/// A tenant's counters with their ceilings and reset instants
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageSnapshot {
    pub day_count: u64,
    pub day_quota: u64,
    pub day_resets: DateTime<Utc>,
    pub month_count: u64,
    pub month_quota: u64,
    pub month_resets: DateTime<Utc>,
}

/// Tracks daily and monthly request counts per tenant
#[derive(Default)]
pub struct TenantUsage {
    counters: Mutex<HashMap<String, UsageWindow>>,
}

impl TenantUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against the tenant. Returns the updated snapshot,
    /// or a rate status describing the exceeded band.
    pub fn record(
        &self,
        tenant: &str,
        quotas: TenantQuotas,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, RateStatus> {
        let day_id = period::aligned_id(Period::Day, now);
        let month_id = period::aligned_id(Period::Month, now);

        let mut counters = self.counters.lock();
        let window = counters.entry(tenant.to_string()).or_default();

        // Crossing a UTC boundary resets the band
        if window.day_id != day_id {
            window.day_id = day_id;
            window.day_count = 0;
        }
        if window.month_id != month_id {
            window.month_id = month_id;
            window.month_count = 0;
        }

        if window.day_count >= quotas.daily {
            return Err(RateStatus {
                allowed: false,
                limit: quotas.daily,
                remaining: 0,
                reset_secs: seconds_until(period::period_end(Period::Day, now), now),
            });
        }
        if window.month_count >= quotas.monthly {
            return Err(RateStatus {
                allowed: false,
                limit: quotas.monthly,
                remaining: 0,
                reset_secs: seconds_until(period::period_end(Period::Month, now), now),
            });
        }

        window.day_count += 1;
        window.month_count += 1;

        Ok(UsageSnapshot {
            day_count: window.day_count,
            day_quota: quotas.daily,
            day_resets: period::period_end(Period::Day, now),
            month_count: window.month_count,
            month_quota: quotas.monthly,
            month_resets: period::period_end(Period::Month, now),
        })
    }

    /// Read counters without recording a request
    pub fn snapshot(&self, tenant: &str, quotas: TenantQuotas, now: DateTime<Utc>) -> UsageSnapshot {
        let day_id = period::aligned_id(Period::Day, now);
        let month_id = period::aligned_id(Period::Month, now);

        let counters = self.counters.lock();
        let (day_count, month_count) = counters
            .get(tenant)
            .map(|w| {
                (
                    if w.day_id == day_id { w.day_count } else { 0 },
                    if w.month_id == month_id { w.month_count } else { 0 },
                )
            })
            .unwrap_or((0, 0));

        UsageSnapshot {
            day_count,
            day_quota: quotas.daily,
            day_resets: period::period_end(Period::Day, now),
            month_count,
            month_quota: quotas.monthly,
            month_resets: period::period_end(Period::Month, now),
        }
    }
}

fn seconds_until(later: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (later - now).num_seconds().max(0) as u64
}
