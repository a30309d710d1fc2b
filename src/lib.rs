pub mod app;
pub mod auth;
pub mod behavior;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod platform;
pub mod presence;
pub mod prompting;
pub mod realtime;
pub mod relay;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod typing;
