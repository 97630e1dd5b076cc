//! Session persistence: a TTL key/value store with a phone index.

pub mod libsql_backend;
mod memory;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlSessionStore;
pub use memory::InMemorySessionStore;
pub use traits::SessionStore;
