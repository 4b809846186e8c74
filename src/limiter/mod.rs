// Module: Limiter
// Token-bucket rate limiting keyed per host (or one global bucket).
// Effective rate priority for a step: the row's reqs_sec (paced strictly,
// burst 1), then the CLI override, then the config default. Buckets are
// built lazily and rebuilt when a key's effective rate changes.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::config::RateLimitSettings;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const GLOBAL_KEY: &str = "__global__";

struct Bucket {
    rate: f64,
    burst: u32,
    limiter: Arc<DirectLimiter>,
}

pub struct RateGate {
    enabled: bool,
    per_host: bool,
    default_rate: Option<f64>,
    default_burst: Option<u32>,
    cli_override: Option<f64>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateGate {
    pub fn new(settings: &RateLimitSettings, cli_override: Option<f64>) -> Self {
        Self {
            enabled: settings.enabled,
            per_host: settings.per_host,
            default_rate: settings.default_reqs_per_sec,
            default_burst: settings.burst_size,
            cli_override,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Unlimited gate (dry runs, tests).
    pub fn disabled() -> Self {
        Self::new(&RateLimitSettings::default(), None)
    }

    /// The (rate, burst) a step runs under, or None when nothing limits
    /// it. A row-level rate paces strictly: burst 1.
    fn effective(&self, step_rate: Option<f64>) -> Option<(f64, u32)> {
        if let Some(rate) = step_rate.filter(|r| *r > 0.0) {
            return Some((rate, 1));
        }
        if let Some(rate) = self.cli_override.filter(|r| *r > 0.0) {
            let burst = self.default_burst.unwrap_or_else(|| rate.round().max(1.0) as u32);
            return Some((rate, burst.max(1)));
        }
        if !self.enabled {
            return None;
        }
        let rate = self.default_rate.filter(|r| *r > 0.0)?;
        let burst = self.default_burst.unwrap_or_else(|| rate.round().max(1.0) as u32);
        Some((rate, burst.max(1)))
    }

    fn bucket(&self, key: &str, rate: f64, burst: u32) -> Arc<DirectLimiter> {
        let mut buckets = self.buckets.lock().expect("rate bucket map poisoned");
        if let Some(bucket) = buckets.get(key) {
            if bucket.rate == rate && bucket.burst == burst {
                return Arc::clone(&bucket.limiter);
            }
        }
        let period = Duration::from_secs_f64(1.0 / rate);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::new(1).unwrap()));
        let limiter = Arc::new(RateLimiter::direct(quota));
        buckets.insert(
            key.to_string(),
            Bucket {
                rate,
                burst,
                limiter: Arc::clone(&limiter),
            },
        );
        limiter
    }

    /// Waits for a token and reports how long the caller was held.
    /// Returns zero immediately when no limit applies.
    pub async fn acquire(&self, host: &str, step_rate: Option<f64>) -> Duration {
        let Some((rate, burst)) = self.effective(step_rate) else {
            return Duration::ZERO;
        };
        let key = if self.per_host { host } else { GLOBAL_KEY };
        let limiter = self.bucket(key, rate, burst);

        let started = Instant::now();
        limiter.until_ready().await;
        started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool, rate: Option<f64>, burst: Option<u32>) -> RateLimitSettings {
        RateLimitSettings {
            enabled,
            default_reqs_per_sec: rate,
            per_host: true,
            burst_size: burst,
        }
    }

    #[tokio::test]
    async fn test_disabled_gate_returns_zero_wait() {
        let gate = RateGate::new(&settings(false, None, None), None);
        let wait = gate.acquire("host-a", None).await;
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_step_rate_paces_consecutive_acquisitions() {
        // 20 rps, burst 1: five acquisitions need >= 4 inter-token gaps
        // of 50ms, minus scheduling slack.
        let gate = RateGate::new(&settings(false, None, None), None);
        let started = Instant::now();
        for _ in 0..5 {
            gate.acquire("host-a", Some(20.0)).await;
        }
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(180),
            "expected pacing, got {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_burst_allows_initial_batch() {
        let gate = RateGate::new(&settings(true, Some(5.0), Some(3)), None);
        let started = Instant::now();
        for _ in 0..3 {
            gate.acquire("host-a", None).await;
        }
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "burst capacity must admit the first three without waiting"
        );
    }

    #[tokio::test]
    async fn test_keys_do_not_block_each_other() {
        let gate = RateGate::new(&settings(false, None, None), None);
        gate.acquire("host-a", Some(2.0)).await;
        // host-a's bucket is now empty, but host-b has its own.
        let started = Instant::now();
        gate.acquire("host-b", Some(2.0)).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cli_override_applies_when_config_disabled() {
        let gate = RateGate::new(&settings(false, None, None), Some(50.0));
        let started = Instant::now();
        for _ in 0..3 {
            gate.acquire("host-a", None).await;
        }
        // 50 rps with burst 50: no meaningful wait, but a limit exists.
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_effective_rate_priority() {
        let gate = RateGate::new(&settings(true, Some(1.0), None), Some(10.0));
        // Row rate wins and forces strict pacing.
        assert_eq!(gate.effective(Some(2.0)), Some((2.0, 1)));
        // Then the CLI override.
        assert_eq!(gate.effective(None), Some((10.0, 10)));

        let gate = RateGate::new(&settings(true, Some(4.0), Some(2)), None);
        assert_eq!(gate.effective(None), Some((4.0, 2)));

        let gate = RateGate::new(&settings(false, Some(4.0), None), None);
        assert_eq!(gate.effective(None), None, "disabled config rate does not apply");
    }
}
