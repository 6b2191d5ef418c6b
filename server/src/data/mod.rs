//! Data layer: stream broker, message store, cache, file storage

pub mod cache;
pub mod files;
pub mod sqlite;
pub mod streams;
pub mod types;

pub use cache::{CacheService, RateLimiter};
pub use files::FileService;
pub use sqlite::SqliteService;
pub use streams::{StreamName, StreamService};
