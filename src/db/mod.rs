//! Database layer - connection pooling, IAM auth, target schema and bulk loading

pub mod connector;
pub mod loader;
pub mod pool;
pub mod schema;

pub use connector::Connector;
pub use loader::BulkLoader;
pub use pool::Pool;
