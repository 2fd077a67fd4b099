//! Market-data access: rate limiting, HTTP fetch, caches, persistence.

pub mod cache;
pub mod limiter;
pub mod polygon;
pub mod store;
pub mod transport;
pub mod volume;
