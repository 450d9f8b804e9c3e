//! Local SQLite cache. The server is authoritative for worldlines and
//! events; this layer only remembers the last-active worldline per thread
//! and keeps cached lists for fast session hydration.

pub mod cache;
pub mod database;
pub mod error;
pub mod prefs;
pub mod row_helpers;
pub mod schema;

pub use cache::CacheRepo;
pub use database::Database;
pub use error::StoreError;
pub use prefs::PrefsRepo;
