pub mod writer;

pub use writer::{
    heartbeat_is_online, read_heartbeat, read_progress, Heartbeat, ProgressReport,
    ProgressSnapshot, StateWriter,
};
