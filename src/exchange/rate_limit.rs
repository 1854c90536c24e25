//! Per-(exchange, endpoint class) request throttling
//!
//! Buckets are sized to the documented exchange ceiling times a safety
//! factor, so a burst from this process never lands at the published
//! limit. Upbit is additionally forced sequential: one request in
//! flight at a time with a minimum spacing.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::Exchange;

/// Endpoint classes with distinct documented ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Order placement / cancel.
    Order,
    /// Account and order queries.
    Query,
    /// Public market data.
    Market,
}

/// Documented requests-per-second ceiling, before the safety factor.
fn documented_ceiling(exchange: Exchange, class: EndpointClass) -> f64 {
    match (exchange, class) {
        (Exchange::Binance, EndpointClass::Order) => 10.0,
        (Exchange::Binance, EndpointClass::Query) => 20.0,
        (Exchange::Binance, EndpointClass::Market) => 20.0,
        (Exchange::Bybit, EndpointClass::Order) => 10.0,
        (Exchange::Bybit, _) => 20.0,
        (Exchange::Upbit, EndpointClass::Order) => 8.0,
        (Exchange::Upbit, _) => 10.0,
        (Exchange::Bithumb, EndpointClass::Order) => 8.0,
        (Exchange::Bithumb, _) => 10.0,
    }
}

/// Classic token bucket; `acquire` waits until a token is available.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            capacity,
            refill_per_sec: rate_per_sec,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (ref mut tokens, ref mut last) = *state;
                let elapsed = last.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
                *last = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                (1.0 - *tokens) / self.refill_per_sec
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// Guard returned for sequential exchanges; holds the exchange's single
/// in-flight slot until the request completes.
pub struct SequentialGuard {
    _guard: OwnedMutexGuard<Instant>,
}

/// Registry of token buckets plus the sequential pacers.
pub struct RateLimiters {
    safety: f64,
    buckets: DashMap<(Exchange, EndpointClass), Arc<TokenBucket>>,
    pacers: DashMap<Exchange, Arc<Mutex<Instant>>>,
    min_spacing: Duration,
}

impl RateLimiters {
    pub fn new(safety: f64) -> Self {
        Self {
            safety,
            buckets: DashMap::new(),
            pacers: DashMap::new(),
            min_spacing: Duration::from_millis(125),
        }
    }

    fn bucket(&self, exchange: Exchange, class: EndpointClass) -> Arc<TokenBucket> {
        self.buckets
            .entry((exchange, class))
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    documented_ceiling(exchange, class) * self.safety,
                ))
            })
            .clone()
    }

    fn needs_sequencing(exchange: Exchange) -> bool {
        matches!(exchange, Exchange::Upbit)
    }

    /// Wait for a request slot. The returned guard, when present, must be
    /// held for the duration of the HTTP call.
    pub async fn throttle(
        &self,
        exchange: Exchange,
        class: EndpointClass,
    ) -> Option<SequentialGuard> {
        self.bucket(exchange, class).acquire().await;

        if !Self::needs_sequencing(exchange) {
            return None;
        }

        let pacer = self
            .pacers
            .entry(exchange)
            .or_insert_with(|| Arc::new(Mutex::new(Instant::now() - Duration::from_secs(1))))
            .clone();

        let mut guard = pacer.lock_owned().await;
        let since_last = guard.elapsed();
        if since_last < self.min_spacing {
            tokio::time::sleep(self.min_spacing - since_last).await;
        }
        *guard = Instant::now();
        Some(SequentialGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_allows_burst_up_to_capacity() {
        let bucket = TokenBucket::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_bucket_throttles_past_capacity() {
        let bucket = TokenBucket::new(10.0);
        let start = Instant::now();
        for _ in 0..12 {
            bucket.acquire().await;
        }
        // Two tokens over capacity at 10/s costs ~200ms.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_upbit_is_sequential() {
        let limiters = RateLimiters::new(0.55);
        let g1 = limiters.throttle(Exchange::Upbit, EndpointClass::Order).await;
        assert!(g1.is_some());

        let g2 = limiters.throttle(Exchange::Binance, EndpointClass::Order).await;
        assert!(g2.is_none());
    }

    #[tokio::test]
    async fn test_upbit_spacing_enforced() {
        let limiters = RateLimiters::new(10.0); // big safety so the bucket is not the limiter
        let start = Instant::now();
        drop(limiters.throttle(Exchange::Upbit, EndpointClass::Query).await);
        drop(limiters.throttle(Exchange::Upbit, EndpointClass::Query).await);
        assert!(start.elapsed() >= Duration::from_millis(125));
    }
}
