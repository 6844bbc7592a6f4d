mod connection;
mod migrations;

pub use connection::{open_connection, open_in_memory};
pub use migrations::{run_migrations, schema_version};
