//! # lumen-server
//!
//! Axum HTTP + `WebSocket` transport for the realtime manager.
//!
//! - `GET /ws?userId=..&topicId=..`: live connection, registered with the manager
//! - `GET /health`, `GET /stats`, `GET /metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod health;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod websocket;
