// Redaction pipeline: frame workers, encoder pipe, audio chain and the controller

pub mod audio;
pub mod blur;
pub mod detection;
pub mod encode;
pub mod error;
pub mod orchestrator;
pub mod pitch;
pub mod processor;
pub mod reader;
pub mod stage;
pub mod tool;
pub mod types;
