pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod registry;
pub mod state;
pub mod storage;
pub mod worker;

pub use config::Settings;
pub use error::{Error, Result};
pub use storage::HotStorage;

/// Install the global tracing subscriber (RUST_LOG-filtered).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
