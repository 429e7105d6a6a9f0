use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use zora_core::Orchestrator;

mod http;

pub use http::{build_router, serve};

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);
const RATE_LIMIT_MAX_REQUESTS: usize = 500;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    /// SPA entry point served for unknown non-API paths, when present.
    pub spa_index: Option<PathBuf>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let spa_index = {
            let candidate = orchestrator.base_dir().join("dashboard/index.html");
            candidate.exists().then_some(candidate)
        };
        Self {
            orchestrator,
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MAX_REQUESTS, RATE_LIMIT_WINDOW)),
            spa_index,
        }
    }
}

/// Sliding-window request counter per client IP.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit; returns false once the caller is over the limit.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter lock");
        let entry = hits.entry(ip).or_default();
        entry.retain(|at| now.duration_since(*at) < self.window);
        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push(now);
        true
    }
}

pub(crate) fn client_ip(
    connect_info: Option<&axum::extract::ConnectInfo<SocketAddr>>,
) -> IpAddr {
    connect_info
        .map(|info| info.0.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}
