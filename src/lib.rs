pub mod agent;
pub mod commands;
pub mod config;
pub mod control;
pub mod daemon;
pub mod errors;
pub mod event_loop;
pub mod fingerprint;
pub mod gateway;
pub mod heartbeat;
pub mod process;
pub mod sink;
pub mod supervisor;
pub mod telemetry;
pub mod wire;
