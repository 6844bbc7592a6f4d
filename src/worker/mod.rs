pub mod runner;

pub use runner::{resume_interrupted, ResumeReport, WorkerRunner};
