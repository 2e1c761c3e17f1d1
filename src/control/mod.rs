//! HTTP control and telemetry

pub mod handlers;
pub mod server;

pub use server::{AppState, ControlServer};
