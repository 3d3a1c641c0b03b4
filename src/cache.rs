use anyhow::{anyhow, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const BOARD_CACHE_TTL: Duration = Duration::from_secs(300);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Entry<T> {
    value: T,
    fetched_at: Instant,
}

/// Single-value cache with a fixed time-to-live.
///
/// A failed refresh falls back to the stale value when there is one.
pub struct TtlCache<T, C: Clock = SystemClock> {
    ttl: Duration,
    clock: C,
    entry: Mutex<Option<Entry<T>>>,
}

impl<T: Clone> TtlCache<T, SystemClock> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock)
    }
}

impl<T: Clone, C: Clock> TtlCache<T, C> {
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self {
            ttl,
            clock,
            entry: Mutex::new(None),
        }
    }

    pub fn get_or_refresh<F>(&self, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut entry = self
            .entry
            .lock()
            .map_err(|_| anyhow!("Board cache lock poisoned"))?;
        let now = self.clock.now();

        if let Some(cached) = entry.as_ref() {
            if now.duration_since(cached.fetched_at) < self.ttl {
                debug!("Board cache hit");
                return Ok(cached.value.clone());
            }
        }

        match fetch() {
            Ok(value) => {
                *entry = Some(Entry {
                    value: value.clone(),
                    fetched_at: now,
                });
                Ok(value)
            }
            Err(e) => match entry.as_ref() {
                Some(stale) => {
                    warn!("Board refresh failed, serving stale copy: {:#}", e);
                    Ok(stale.value.clone())
                }
                None => Err(e),
            },
        }
    }
}
