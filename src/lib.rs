//! Resource-protection layer of the ingredient analysis backend.
//!
//! Every inbound request passes the rate-limit gateway before it reaches a
//! handler, and every expensive lookup (ingredient databases, model
//! enrichment) goes through the tiered cache instead of hitting the
//! upstream again.
//!
//!
//!
//! # Preventing Server Overload
//!
//! **Goal**: one cheap admission decision per request, before any business
//! logic runs, so a burst from a single caller cannot starve everyone else.
//!
//! - Requests resolve to an identifier: the authenticated user if there is
//!   one, else the first address in `X-Forwarded-For`, else the peer
//! - The path picks the policy: auth endpoints are strict, analysis
//!   endpoints are metered, health checks are exempt
//! - A sliding-window log keeps exact event timestamps per identifier, so
//!   the limit holds over any trailing window, not per calendar bucket
//! - Rejections carry `Retry-After`, the seconds until the oldest retained
//!   event leaves the window
//!
//!
//!
//! # Notes
//!
//! ## Redis + local tier
//! In theory we could serve every cache read from Redis alone. But a large
//! share of reads repeat within seconds on a hot key, and a network round
//! trip per read is excessive for data that just left this process. A
//! bounded in-process map in front of Redis serves those repeats at memory
//! speed.
//!
//! We do run into an issue of syncing: the local copy and the Redis copy of
//! an entry are independent, and pattern invalidation only clears Redis.
//! This is a tradeoff we are okay with as eventual consistency is
//! acceptable here; local copies age out on their own TTL.
//!
//! The limiter windows live in Redis sorted sets so all instances see the
//! same counts. The trim/count/record steps execute as one atomic batch,
//! otherwise two concurrent checks could both see `limit - 1` and both
//! pass.
//!
//! ## Degraded modes
//! Redis being down must not take the service with it. The cache then runs
//! local-only, and admission checks fail open rather than closed; a limiter
//! built without a backend at startup falls back to per-instance in-process
//! windows.
//!
//!
//!
//! # Setup
//!
//! Configuration comes from the environment, see `config.rs` for the
//! variables and defaults.
//!
//! ```sh
//! REDIS_URL=redis://127.0.0.1:6379 cargo run
//! ```
use std::{net::SocketAddr, time::Duration};

use axum::{
    http::{header::CONTENT_TYPE, Method},
    middleware,
    routing::get,
    Router,
};

use signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod limiter;
pub mod local;
pub mod routes;
pub mod state;
pub mod stats;
pub mod utils;

use gateway::admit;
use routes::{health_handler, stats_handler};
use state::AppState;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(Duration::from_secs(sweeper.config.sweep_interval_secs));
        loop {
            tick.tick().await;
            sweeper.limiter.sweep_idle();
        }
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(middleware::from_fn_with_state(state.clone(), admit))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::gateway::admit;
    use crate::routes::{health_handler, stats_handler};
    use crate::state::AppState;

    fn test_app(config: Config) -> (Arc<AppState>, Router) {
        let state = AppState::assemble(config, None);
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/api/products", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(state.clone(), admit))
            .with_state(state.clone());
        (state, app)
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_over_limit_request_gets_429_with_retry_hint() {
        let mut config = Config::for_tests();
        config.general_limit = 1;
        let (_state, app) = test_app(config);

        let first = app.clone().oneshot(request("/api/products")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request("/api/products")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let retry_after: u64 = second
            .headers()
            .get("retry-after")
            .expect("Retry-After header")
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
    }

    #[tokio::test]
    async fn test_health_and_stats_bypass_the_limiter() {
        let mut config = Config::for_tests();
        config.general_limit = 0;
        let (_state, app) = test_app(config);

        let blocked = app.clone().oneshot(request("/api/products")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

        for _ in 0..3 {
            let health = app.clone().oneshot(request("/health")).await.unwrap();
            assert_eq!(health.status(), StatusCode::OK);
        }
        let stats = app.oneshot(request("/stats")).await.unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_distinct_callers_do_not_interfere() {
        let mut config = Config::for_tests();
        config.general_limit = 1;
        let (_state, app) = test_app(config);

        let a = Request::builder()
            .uri("/api/products")
            .header("x-forwarded-for", "203.0.113.5")
            .body(Body::empty())
            .unwrap();
        let b = Request::builder()
            .uri("/api/products")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();

        assert_eq!(app.clone().oneshot(a).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(b).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejection_is_counted() {
        let mut config = Config::for_tests();
        config.general_limit = 1;
        let (state, app) = test_app(config);

        let _ = app.clone().oneshot(request("/api/products")).await.unwrap();
        let _ = app.oneshot(request("/api/products")).await.unwrap();

        let snap = state
            .limiter_stats
            .snapshot(state.limiter.tracked_identifiers());
        assert_eq!(snap.allowed, 1);
        assert_eq!(snap.rejected, 1);
    }
}
