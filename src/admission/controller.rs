// src/admission/controller.rs

use super::rate_limiter::{RateLimit, RateLimiter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Dropped,
    RateLimited,
}

impl Decision {
    pub fn is_admitted(self) -> bool {
        self == Decision::Admit
    }

    /// Label used for the rejection metric.
    pub fn reason(self) -> &'static str {
        match self {
            Decision::Admit => "admitted",
            Decision::Dropped => "dropped",
            Decision::RateLimited => "rate_limited",
        }
    }
}

/// Decides, right after accept, whether a connection gets a pipeline.
pub struct AdmissionController {
    drop_all: AtomicBool,
    rate_limiter: Option<RateLimiter>,
}

impl AdmissionController {
    pub fn new(rate_limit: Option<RateLimit>) -> Self {
        Self {
            drop_all: AtomicBool::new(false),
            rate_limiter: rate_limit.map(RateLimiter::new),
        }
    }

    pub fn set_drop_all(&self, enabled: bool) {
        self.drop_all.store(enabled, Ordering::SeqCst);
    }

    pub fn drop_all(&self) -> bool {
        self.drop_all.load(Ordering::SeqCst)
    }

    pub fn decide(&self, peer: SocketAddr) -> Decision {
        if self.drop_all() {
            return Decision::Dropped;
        }

        match &self.rate_limiter {
            Some(limiter) if !limiter.admit(peer) => Decision::RateLimited,
            _ => Decision::Admit,
        }
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }
}
