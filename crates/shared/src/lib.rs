#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared vocabulary and infrastructure for the Flowline platform.
//!
//! Everything in here is consumed by more than one crate: the plan/currency
//! type system, database pool construction, and the request rate limiter.

pub mod db;
pub mod rate_limit;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use types::{
    Currency, Environment, PaymentProvider, Plan, PlanTier, SubscriptionStatus,
};
