// src/admission/mod.rs
mod controller;
mod rate_limiter;

pub use controller::{AdmissionController, Decision};
pub use rate_limiter::{RateLimit, RateLimiter};
