// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod frame;
pub mod history_api;
pub mod snapshot;
pub mod stream_client;
