//! HTTP and WebSocket service surface

pub mod server;
pub mod handlers;
pub mod websocket;

pub use server::{ApiServer, AppState};
