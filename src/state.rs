use std::sync::Arc;

use redis::aio::ConnectionManager;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::database::init_redis;
use crate::gateway::PolicyTable;
use crate::limiter::RateLimiter;
use crate::stats::LimiterStats;

/// The protection layer's service objects, built once at startup and passed
/// into request handling by reference. Tests assemble isolated instances
/// through [`AppState::assemble`].
pub struct AppState {
    pub config: Config,
    pub cache: TieredCache,
    pub limiter: RateLimiter,
    pub policies: PolicyTable,
    pub limiter_stats: LimiterStats,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();
        let redis = init_redis(&config.redis_url).await;
        Self::assemble(config, redis)
    }

    pub fn assemble(config: Config, redis: Option<ConnectionManager>) -> Arc<Self> {
        let policies = PolicyTable::from_config(&config);
        let cache = TieredCache::new(&config, redis.clone());
        let limiter = RateLimiter::new(redis, config.retention_secs);

        Arc::new(Self {
            config,
            cache,
            limiter,
            policies,
            limiter_stats: LimiterStats::default(),
        })
    }
}
