//! # Sliding-Window Rate Limiter
//!
//! Sliding-window log: exact event timestamps are kept per
//! identifier+scope, and a check counts the events inside the trailing
//! window before recording its own.
//!
//! Against Redis the trim/count/record/refresh steps run as one
//! `MULTI`/`EXEC` batch, so concurrent checks on the same identifier cannot
//! both read `limit - 1` and both pass. The batch always records the event;
//! when the pre-record count was already at the limit, the check removes
//! the event it just wrote so rejected traffic consumes no quota.
//!
//! Without a reachable backend the limiter runs an in-process window with a
//! per-identifier lock (never one global lock, unrelated identifiers must
//! not serialize each other). That mode protects this instance only, not
//! the fleet. A sweep drops identifiers idle past the retention horizon.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use redis::aio::ConnectionManager;

use crate::error::AppError;
use crate::utils::{now_ms, rate_limit_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    remote: Option<ConnectionManager>,
    windows: Mutex<HashMap<String, Arc<Mutex<VecDeque<u64>>>>>,
    retention_secs: u64,
    seq: AtomicU64,
}

impl RateLimiter {
    pub fn new(remote: Option<ConnectionManager>, retention_secs: u64) -> Self {
        Self {
            remote,
            windows: Mutex::new(HashMap::new()),
            retention_secs,
            seq: AtomicU64::new(0),
        }
    }

    /// One admission check. An error here means the shared store failed
    /// mid-call; the gateway treats that as fail-open.
    pub async fn check(
        &self,
        identifier: &str,
        scope: &str,
        policy: Policy,
    ) -> Result<Decision, AppError> {
        let now = now_ms();
        match self.remote.clone() {
            Some(conn) => self.check_remote(conn, identifier, scope, policy, now).await,
            None => Ok(self.check_local(identifier, scope, policy, now)),
        }
    }

    /// Number of identifier windows held in process memory.
    pub fn tracked_identifiers(&self) -> usize {
        self.windows.lock().unwrap().len()
    }

    /// Drops identifiers whose newest event is older than the retention
    /// horizon. Only the in-process windows need this; Redis keys expire on
    /// their own.
    pub fn sweep_idle(&self) {
        self.sweep_idle_at(now_ms());
    }

    async fn check_remote(
        &self,
        mut conn: ConnectionManager,
        identifier: &str,
        scope: &str,
        policy: Policy,
        now_ms: u64,
    ) -> Result<Decision, AppError> {
        let key = rate_limit_key(identifier, scope);
        let window_ms = policy.window_secs * 1000;
        let window_start = now_ms.saturating_sub(window_ms);
        let member = format!("{now_ms}-{}", self.seq.fetch_add(1, Ordering::Relaxed));

        let mut batch = redis::pipe();
        batch
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(window_start)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(policy.window_secs + 1)
            .ignore();
        let (count,): (u64,) = batch.query_async(&mut conn).await?;

        if count < policy.limit as u64 {
            return Ok(Decision {
                allowed: true,
                remaining: policy.limit - count as u32 - 1,
                retry_after_secs: 0,
            });
        }

        // Already full: take back the event recorded above and read the
        // oldest survivor for the retry hint.
        let mut rollback = redis::pipe();
        rollback
            .cmd("ZREM")
            .arg(&key)
            .arg(&member)
            .ignore()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES");
        let (oldest,): (Vec<(String, f64)>,) = rollback.query_async(&mut conn).await?;

        let retry_after_secs = oldest
            .first()
            .map(|(_, score)| retry_after(*score as u64, window_ms, now_ms))
            .unwrap_or(1);

        Ok(Decision {
            allowed: false,
            remaining: 0,
            retry_after_secs,
        })
    }

    fn check_local(&self, identifier: &str, scope: &str, policy: Policy, now_ms: u64) -> Decision {
        let key = rate_limit_key(identifier, scope);

        // The registry lock only covers the entry lookup; the window itself
        // has its own lock so identifiers never serialize each other.
        let window = {
            let mut windows = self.windows.lock().unwrap();
            windows
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
                .clone()
        };

        let window_ms = policy.window_secs * 1000;
        let window_start = now_ms.saturating_sub(window_ms);

        let mut events = window.lock().unwrap();
        while events.front().is_some_and(|&t| t <= window_start) {
            events.pop_front();
        }

        if (events.len() as u64) < policy.limit as u64 {
            events.push_back(now_ms);
            return Decision {
                allowed: true,
                remaining: policy.limit - events.len() as u32,
                retry_after_secs: 0,
            };
        }

        let retry_after_secs = events
            .front()
            .map(|&oldest| retry_after(oldest, window_ms, now_ms))
            .unwrap_or_else(|| policy.window_secs.max(1));

        Decision {
            allowed: false,
            remaining: 0,
            retry_after_secs,
        }
    }

    fn sweep_idle_at(&self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(self.retention_secs * 1000);
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, window| {
            let events = window.lock().unwrap();
            events.back().is_some_and(|&t| t > horizon)
        });
    }
}

/// Seconds until the oldest retained event leaves the window, rounded up.
fn retry_after(oldest_ms: u64, window_ms: u64, now_ms: u64) -> u64 {
    (oldest_ms + window_ms)
        .saturating_sub(now_ms)
        .div_ceil(1000)
        .max(1)
}
