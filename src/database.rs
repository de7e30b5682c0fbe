//! # Redis
//!
//! Shared store backing the distributed cache tier and the rate limiter
//! windows. Visible to every service instance and mutated by any of them;
//! no instance owns it exclusively.
//!
//! ## Requirements
//!
//! - `GET`/`SETEX`/`DEL` plus `SCAN MATCH` for the cache tier
//! - Sorted-set operations (`ZREMRANGEBYSCORE`, `ZCARD`, `ZADD`, `EXPIRE`)
//!   that the limiter batches into one atomic `MULTI`/`EXEC` per check
//!
//! ## Degradation
//!
//! The layer must never be the reason a request fails, so an unreachable
//! backend at startup is not fatal: we log it and run local-only. The cache
//! then serves from the process tier and the limiter falls back to its
//! in-process window, which protects this instance but not the fleet.

use std::time::Duration;

use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    Client,
};
use tracing::warn;

pub async fn init_redis(redis_url: &str) -> Option<ConnectionManager> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = match Client::open(redis_url) {
        Ok(client) => client,
        Err(e) => {
            warn!("Invalid Redis URL, running local-only: {e}");
            return None;
        }
    };

    match client.get_connection_manager_with_config(config).await {
        Ok(connection_manager) => Some(connection_manager),
        Err(e) => {
            warn!("Redis unreachable, running local-only: {e}");
            None
        }
    }
}
