use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tonic::Status;
use tracing::debug;

use super::{Call, Interceptor, Next, Reply};

/// Process-wide admission gate using a token bucket.
///
/// Refills at `rate` tokens per second and holds at most `rate` tokens, so a
/// full second's worth of requests may arrive at once. Cloning shares the
/// bucket; both gRPC servers hold clones of the same limiter.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
    stats: Arc<RateLimiterStats>,
    rate: u64,
}

struct RateLimiterState {
    tokens: f64,
    last_update: Instant,
}

#[derive(Default)]
struct RateLimiterStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter admitting `requests_per_second`.
    pub fn new(requests_per_second: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                tokens: requests_per_second as f64,
                last_update: Instant::now(),
            })),
            stats: Arc::new(RateLimiterStats::default()),
            rate: requests_per_second,
        }
    }

    /// Configured requests per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Attempts to acquire a token for a request.
    ///
    /// Returns `Ok(())` if a token was acquired, `Err(Status)` if rate limit exceeded.
    /// The lock is held only for the refill arithmetic.
    #[allow(clippy::result_large_err)]
    pub fn check_rate_limit(&self) -> Result<(), Status> {
        let admitted = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_update).as_secs_f64();

            state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
            state.last_update = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                true
            } else {
                false
            }
        };

        if admitted {
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            Err(Status::resource_exhausted("rate limit exceeded"))
        }
    }

    /// Requests admitted so far.
    pub fn admitted(&self) -> u64 {
        self.stats.admitted.load(Ordering::Relaxed)
    }

    /// Requests rejected so far.
    pub fn rejected(&self) -> u64 {
        self.stats.rejected.load(Ordering::Relaxed)
    }
}

/// Chain stage consulting the shared [`RateLimiter`].
pub struct RateLimitInterceptor {
    limiter: RateLimiter,
}

impl RateLimitInterceptor {
    /// Wraps a shared limiter.
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn intercept(&self, call: &Call<'_>, next: Next<'_>) -> Result<Reply, Status> {
        if let Err(status) = self.limiter.check_rate_limit() {
            counter!("rpc.rate_limited", "method" => call.method).increment(1);
            debug!(method = call.method, "request rejected by rate limiter");
            return Err(status);
        }
        next.run(call).await
    }
}
