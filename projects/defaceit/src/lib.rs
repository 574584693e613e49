pub mod cli;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod run_context;
pub mod video;
