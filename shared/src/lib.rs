/// Shared building blocks for the Vidbot crates.
pub mod config;
pub mod errors;
pub mod models;
pub mod settings;
pub mod task_queue;
