//! # Gateway
//!
//! Admission control in front of every route. Each request resolves to an
//! identifier (who is asking) and a policy (what its path category allows),
//! then goes through one limiter check. Rejections come back as 429 with a
//! `Retry-After` hint; health paths are exempt by category.
//!
//! The gateway fails open: if the check itself errors, the request goes
//! through and the failure is logged. The protection layer must never be
//! the outage.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::config::Config;
use crate::error::AppError;
use crate::limiter::Policy;
use crate::state::AppState;

/// Authenticated caller, inserted into request extensions by the auth
/// layer upstream of this one.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteCategory {
    Auth,
    Analysis,
    Health,
    General,
}

impl RouteCategory {
    pub fn scope(self) -> &'static str {
        match self {
            RouteCategory::Auth => "auth",
            RouteCategory::Analysis => "analysis",
            RouteCategory::Health => "health",
            RouteCategory::General => "general",
        }
    }
}

/// Ordered path-prefix table mapping routes to categories, and categories
/// to policies. Health has no policy on purpose: it means exempt.
pub struct PolicyTable {
    prefixes: Vec<(&'static str, RouteCategory)>,
    policies: HashMap<RouteCategory, Policy>,
}

impl PolicyTable {
    pub fn from_config(config: &Config) -> Self {
        let policies = HashMap::from([
            (
                RouteCategory::Auth,
                Policy {
                    limit: config.auth_limit,
                    window_secs: config.auth_window_secs,
                },
            ),
            (
                RouteCategory::Analysis,
                Policy {
                    limit: config.analysis_limit,
                    window_secs: config.analysis_window_secs,
                },
            ),
            (
                RouteCategory::General,
                Policy {
                    limit: config.general_limit,
                    window_secs: config.general_window_secs,
                },
            ),
        ]);

        Self::new(
            vec![
                ("/health", RouteCategory::Health),
                ("/stats", RouteCategory::Health),
                ("/api/auth", RouteCategory::Auth),
                ("/api/analyze", RouteCategory::Analysis),
            ],
            policies,
        )
    }

    pub(crate) fn new(
        prefixes: Vec<(&'static str, RouteCategory)>,
        policies: HashMap<RouteCategory, Policy>,
    ) -> Self {
        Self { prefixes, policies }
    }

    /// First matching prefix wins; everything unmatched is general traffic.
    pub fn resolve(&self, path: &str) -> RouteCategory {
        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map(|(_, category)| *category)
            .unwrap_or(RouteCategory::General)
    }

    /// Policy for a category, or `None` when the category is exempt.
    /// A metered category nobody configured gets the most permissive
    /// configured policy instead of blocking traffic.
    pub fn policy(&self, category: RouteCategory) -> Option<Policy> {
        if category == RouteCategory::Health {
            return None;
        }
        match self.policies.get(&category) {
            Some(policy) => Some(*policy),
            None => {
                warn!("No policy configured for {category:?}, using the most permissive");
                self.policies.values().max_by_key(|p| p.limit).copied()
            }
        }
    }
}

/// Caller identity for rate limiting: the authenticated principal when
/// there is one, else the first forwarded address, else the peer.
pub fn resolve_identifier(
    principal: Option<&str>,
    forwarded_for: Option<&str>,
    peer: Option<SocketAddr>,
) -> String {
    if let Some(principal) = principal {
        return format!("user:{principal}");
    }

    if let Some(chain) = forwarded_for {
        if let Some(first) = chain.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
            return format!("ip:{first}");
        }
    }

    match peer {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

/// The once-per-request admission check, layered over every route.
pub async fn admit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let category = state.policies.resolve(req.uri().path());
    let Some(policy) = state.policies.policy(category) else {
        return next.run(req).await;
    };

    let principal = req.extensions().get::<Principal>().map(|p| p.0.as_str());
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identifier = resolve_identifier(principal, forwarded_for, peer);

    match state.limiter.check(&identifier, category.scope(), policy).await {
        Ok(decision) if decision.allowed => {
            state.limiter_stats.record_allowed();
            next.run(req).await
        }
        Ok(decision) => {
            state.limiter_stats.record_rejected();
            warn!(
                "Rejected {identifier} on {} ({}s backoff)",
                req.uri().path(),
                decision.retry_after_secs
            );
            AppError::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            }
            .into_response()
        }
        Err(e) => {
            state.limiter_stats.record_failed_open();
            warn!("Rate limit check failed for {identifier}, admitting: {e}");
            next.run(req).await
        }
    }
}
