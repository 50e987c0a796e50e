pub mod clock;
pub mod config;
pub mod consumer;
pub mod driver;
pub mod github;
pub mod ingest;
pub mod lifecycle;
pub mod queue;
pub mod store;
pub mod sweep;
pub mod terminal;
