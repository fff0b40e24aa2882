//! Shared server state: the active session slot, the set of bound forward
//! listeners, the stream concurrency counter, and the admission rate limiter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use shared::mux::MuxSession;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{info, warn};

pub(crate) const MAX_CONCURRENT_STREAMS: usize = 1000;
pub(crate) const RATE_MAX_TOKENS: u32 = 100;
pub(crate) const RATE_REFILL_PERIOD: Duration = Duration::from_millis(10);
pub(crate) const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct TunnelServer {
    active: RwLock<Option<Arc<MuxSession>>>,
    // Bound forward ports. Entries are never removed: a reconnecting client
    // re-uses the listeners its predecessor session left behind.
    listeners: Mutex<HashMap<u16, SocketAddr>>,
    stream_count: AtomicUsize,
    rate: Mutex<RateLimiter>,
}

impl TunnelServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            active: RwLock::new(None),
            listeners: Mutex::new(HashMap::new()),
            stream_count: AtomicUsize::new(0),
            rate: Mutex::new(RateLimiter::new(RATE_MAX_TOKENS, RATE_REFILL_PERIOD)),
        })
    }

    /// Install a freshly handshaked session, closing any predecessor before
    /// the new one becomes visible to the forward loops.
    pub(crate) async fn set_active_session(&self, session: Arc<MuxSession>) {
        let mut slot = self.active.write().await;
        if let Some(previous) = slot.take() {
            info!("evicting previous tunnel session");
            // The close keeps running in its driver task even if the write
            // stalls past the deadline.
            if timeout(SESSION_CLOSE_TIMEOUT, previous.close()).await.is_err() {
                warn!("evicted session did not close within the deadline");
            }
        }
        self.stream_count.store(0, Ordering::Release);
        *slot = Some(session);
    }

    pub(crate) async fn active_session(&self) -> Option<Arc<MuxSession>> {
        self.active.read().await.clone()
    }

    /// Clear the slot only if it still holds this exact session, so a handler
    /// finishing late cannot wipe out a successor.
    pub(crate) async fn clear_active_session(&self, session: &Arc<MuxSession>) {
        let mut slot = self.active.write().await;
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            *slot = None;
            self.stream_count.store(0, Ordering::Release);
        }
    }

    pub(crate) async fn has_listener(&self, port: u16) -> bool {
        self.listeners.lock().await.contains_key(&port)
    }

    pub(crate) async fn add_listener(&self, port: u16, bound_addr: SocketAddr) {
        self.listeners.lock().await.insert(port, bound_addr);
    }

    /// Check-and-increment against the concurrency cap.
    pub(crate) fn increment_streams(&self) -> bool {
        self.stream_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < MAX_CONCURRENT_STREAMS).then_some(count + 1)
            })
            .is_ok()
    }

    /// Saturating decrement; an install/clear reset may have already zeroed
    /// the counter under this stream.
    pub(crate) fn decrement_streams(&self) {
        let _ = self
            .stream_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }

    pub(crate) fn current_streams(&self) -> usize {
        self.stream_count.load(Ordering::Acquire)
    }

    pub(crate) async fn allow_stream(&self) -> bool {
        self.rate.lock().await.allow()
    }
}

/// Token bucket with lazy refill. `last_refill` advances by whole refill
/// periods, never to `now`, so bursty checks do not under-deliver tokens.
pub(crate) struct RateLimiter {
    tokens: u32,
    max_tokens: u32,
    refill_period: Duration,
    last_refill: Instant,
}

impl RateLimiter {
    pub(crate) fn new(max_tokens: u32, refill_period: Duration) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_period,
            last_refill: Instant::now(),
        }
    }

    pub(crate) fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let quanta =
            u32::try_from(elapsed.as_nanos() / self.refill_period.as_nanos()).unwrap_or(u32::MAX);
        if quanta > 0 {
            self.tokens = self.tokens.saturating_add(quanta).min(self.max_tokens);
            self.last_refill += self.refill_period * quanta;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_a_full_burst_then_refuses() {
        let mut limiter = RateLimiter::new(100, Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow_at(start));
        }
        assert!(!limiter.allow_at(start));
    }

    #[test]
    fn bucket_refills_one_token_per_period() {
        let mut limiter = RateLimiter::new(100, Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow_at(start));
        }
        assert!(!limiter.allow_at(start));

        let later = start + Duration::from_millis(10);
        assert!(limiter.allow_at(later));
        assert!(!limiter.allow_at(later));

        let much_later = start + Duration::from_millis(60);
        for _ in 0..5 {
            assert!(limiter.allow_at(much_later));
        }
        assert!(!limiter.allow_at(much_later));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut limiter = RateLimiter::new(100, Duration::from_millis(10));
        let start = Instant::now();
        assert!(limiter.allow_at(start));

        // A long idle period restores at most max_tokens.
        let later = start + Duration::from_secs(3600);
        for _ in 0..100 {
            assert!(limiter.allow_at(later));
        }
        assert!(!limiter.allow_at(later));
    }

    #[test]
    fn steady_rate_is_never_refused_after_warm_up() {
        let mut limiter = RateLimiter::new(100, Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow_at(start));
        }

        // One check per refill period, indefinitely: every one is admitted
        // because the refill quantum advances without drift.
        for step in 1..=1000u64 {
            let now = start + Duration::from_millis(10 * step);
            assert!(limiter.allow_at(now), "refused at step {step}");
        }
    }

    #[test]
    fn off_phase_checks_do_not_lose_tokens() {
        let mut limiter = RateLimiter::new(100, Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow_at(start));
        }

        // Checks at 15 ms, 25 ms, 35 ms, ... each land one period after the
        // previous refill boundary and must all be admitted.
        for step in 0..100u64 {
            let now = start + Duration::from_millis(15 + 10 * step);
            assert!(limiter.allow_at(now), "refused at offset {}", 15 + 10 * step);
        }
    }

    #[tokio::test]
    async fn stream_counter_enforces_the_cap() {
        let state = TunnelServer::new();
        for _ in 0..MAX_CONCURRENT_STREAMS {
            assert!(state.increment_streams());
        }
        assert_eq!(state.current_streams(), MAX_CONCURRENT_STREAMS);
        assert!(!state.increment_streams());

        state.decrement_streams();
        assert!(state.increment_streams());
        assert!(!state.increment_streams());
    }

    #[tokio::test]
    async fn stream_counter_saturates_at_zero() {
        let state = TunnelServer::new();
        state.decrement_streams();
        assert_eq!(state.current_streams(), 0);
    }

    #[tokio::test]
    async fn listener_registry_is_append_only() {
        let state = TunnelServer::new();
        let addr: SocketAddr = "127.0.0.1:19001".parse().unwrap();

        assert!(!state.has_listener(19001).await);
        state.add_listener(19001, addr).await;
        assert!(state.has_listener(19001).await);
    }

    #[tokio::test]
    async fn install_and_clear_respect_session_identity() {
        let state = TunnelServer::new();

        let (first_io, first_peer) = tokio::io::duplex(4096);
        let (second_io, second_peer) = tokio::io::duplex(4096);
        let first = Arc::new(MuxSession::server(first_io));
        let second = Arc::new(MuxSession::server(second_io));

        state.increment_streams();
        state.set_active_session(first.clone()).await;
        // Installation resets the stream counter.
        assert_eq!(state.current_streams(), 0);

        state.set_active_session(second.clone()).await;
        // The evicted predecessor is closed before the new one is installed.
        assert!(first.is_closed());

        // A stale clear from the first session's handler must not unseat the
        // second session.
        state.clear_active_session(&first).await;
        assert!(state.active_session().await.is_some());

        state.clear_active_session(&second).await;
        assert!(state.active_session().await.is_none());

        drop(first_peer);
        drop(second_peer);
    }
}
