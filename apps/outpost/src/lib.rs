pub mod auth;
pub mod config;
pub mod exec;
pub mod heartbeat;
pub mod session;
pub mod stats;
pub mod telemetry;
pub mod update;
