//! Persistence layer: the document-store contract, its backends, and the
//! typed policy repository built on top.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod policy_store;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::InMemoryStore;
pub use policy_store::PolicyStore;
pub use traits::{DecisionStore, Filter, FilterOp};
