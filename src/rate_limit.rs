use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::auth::{mask_api_key, parse_credential, Credential};
use crate::openai_error_response;

pub const RATE_LIMIT_EXCEEDED_MESSAGE: &str =
    "Rate limit exceeded for your API key. Please try again later.";

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    pub idle_expiry: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20.0,
            burst: 30,
            idle_expiry: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("requests_per_second must be a positive finite number, got {0}")]
    InvalidRate(f64),
    #[error("burst must be at least 1")]
    ZeroBurst,
    #[error("idle_expiry must be greater than zero")]
    ZeroIdleExpiry,
    #[error("sweep_interval must be greater than zero")]
    ZeroSweepInterval,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), RateLimitConfigError> {
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(RateLimitConfigError::InvalidRate(self.requests_per_second));
        }
        if self.burst == 0 {
            return Err(RateLimitConfigError::ZeroBurst);
        }
        if self.idle_expiry.is_zero() {
            return Err(RateLimitConfigError::ZeroIdleExpiry);
        }
        if self.sweep_interval.is_zero() {
            return Err(RateLimitConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with continuous refill.
///
/// Holds at most `capacity` tokens and gains `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket. `rate` and `capacity` are expected to have
    /// passed [`RateLimitConfig::validate`].
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self::new_at(rate, capacity, Instant::now())
    }

    fn new_at(rate: f64, capacity: u32, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Takes one token if available. The refill clock advances on denials too.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        state.tokens = self.refilled(&state, now);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens the bucket would hold right now, without touching its state.
    pub fn tokens_available(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let state = self.lock();
        self.refilled(&state, now)
    }

    fn refilled(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.rate).min(f64::from(self.capacity))
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // Bucket arithmetic cannot leave the state half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `last_seen` is stored as nanoseconds since the registry epoch so lookups
/// can refresh it under the shared read lock.
#[derive(Debug)]
struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    last_seen: AtomicU64,
}

impl LimiterEntry {
    fn touch(&self, at: u64) {
        self.last_seen.fetch_max(at, Ordering::Relaxed);
    }

    fn idle_for(&self, epoch: Instant, now: Instant) -> Duration {
        let seen = epoch + Duration::from_nanos(self.last_seen.load(Ordering::Relaxed));
        now.saturating_duration_since(seen)
    }
}

#[derive(Debug)]
struct RegistryInner {
    config: RateLimitConfig,
    epoch: Instant,
    entries: RwLock<HashMap<String, LimiterEntry>>,
}

impl RegistryInner {
    fn offset(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Shared map from API key to its bucket. Cloning yields another handle to
/// the same map.
#[derive(Clone, Debug)]
pub struct LimiterRegistry {
    inner: Arc<RegistryInner>,
}

impl LimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                epoch: Instant::now(),
                entries: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Returns the bucket for `key`, creating a full one on first sight.
    ///
    /// Known keys are served under the read lock. A miss re-checks under the
    /// write lock, so concurrent first requests for one key share a bucket.
    pub async fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        let now = Instant::now();
        let seen = self.inner.offset(now);

        if let Some(entry) = self.inner.entries.read().await.get(key) {
            entry.touch(seen);
            return entry.bucket.clone();
        }

        let mut entries = self.inner.entries.write().await;
        let tracked = entries.len();
        match entries.entry(key.to_owned()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                entry.touch(seen);
                entry.bucket.clone()
            }
            Entry::Vacant(vacant) => {
                let config = &self.inner.config;
                let bucket = Arc::new(TokenBucket::new_at(
                    config.requests_per_second,
                    config.burst,
                    now,
                ));
                vacant.insert(LimiterEntry {
                    bucket: bucket.clone(),
                    last_seen: AtomicU64::new(seen),
                });
                tracing::debug!(
                    api_key = %mask_api_key(key),
                    tracked_keys = tracked + 1,
                    "created rate limiter"
                );
                bucket
            }
        }
    }

    /// Drops every entry not seen within `older_than`. Returns how many went.
    pub async fn evict_idle(&self, older_than: Duration) -> usize {
        let mut entries = self.inner.entries.write().await;
        let now = Instant::now();
        let epoch = self.inner.epoch;
        let before = entries.len();
        entries.retain(|_, entry| entry.idle_for(epoch, now) <= older_than);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.entries.read().await.contains_key(key)
    }

    /// Starts the periodic eviction sweep on the current runtime.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_sweeper(cancel.clone()));
        SweeperHandle { cancel, task }
    }

    async fn run_sweeper(self, cancel: CancellationToken) {
        let interval = self.inner.config.sweep_interval;
        let idle_expiry = self.inner.config.idle_expiry;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("rate limiter sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let evicted = self.evict_idle(idle_expiry).await;
            let remaining = self.len().await;
            if evicted > 0 {
                tracing::info!(evicted, remaining, "evicted idle rate limiters");
            } else {
                tracing::debug!(remaining, "rate limiter sweep found nothing idle");
            }
        }
    }
}

/// Owner of a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "rate limiter sweeper ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Middleware gating each request on its caller's bucket.
///
/// Requests without a well-formed bearer token pass straight through; the
/// authentication layer decides what to do with them.
pub async fn rate_limit(
    State(registry): State<LimiterRegistry>,
    request: Request,
    next: Next,
) -> Response {
    let api_key = match parse_credential(request.headers()) {
        Credential::Bearer(token) if !token.is_empty() => Some(token.to_owned()),
        _ => None,
    };
    let Some(api_key) = api_key else {
        return next.run(request).await;
    };

    let bucket = registry.get_or_create(&api_key).await;
    if !bucket.allow() {
        tracing::warn!(api_key = %mask_api_key(&api_key), "rate limit exceeded");
        return openai_error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            RATE_LIMIT_EXCEEDED_MESSAGE,
            None,
            Some(json!(StatusCode::TOO_MANY_REQUESTS.as_u16())),
        );
    }

    let quota = QuotaHeaders::snapshot(&bucket);
    let mut response = next.run(request).await;
    quota.apply(response.headers_mut());
    response
}

/// Quota state captured at admission time.
#[derive(Debug)]
struct QuotaHeaders {
    limit: String,
    remaining: i64,
    reset: u64,
}

impl QuotaHeaders {
    fn snapshot(bucket: &TokenBucket) -> Self {
        let reset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + 1;
        Self {
            limit: format!("{:.2}", bucket.rate()),
            remaining: i64::from(bucket.capacity()) - bucket.tokens_available().floor() as i64,
            reset,
        }
    }

    fn apply(self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.limit) {
            headers.insert(HEADER_LIMIT, value);
        }
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(self.reset));
    }
}
