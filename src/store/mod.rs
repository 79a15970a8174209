//! Persistence: connection setup, migrations, the single-writer queue and
//! the token registry.

pub mod database;
pub mod token_registry;
pub mod writer;

pub use database::{apply_migrations, open_connection, resolve_db_path};
pub use token_registry::{TokenIdentity, TokenRegistry};
pub use writer::{DatabaseWriter, Priority};
