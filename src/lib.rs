//! Goule - a self-hosted reverse proxy and service supervisor
//!
//! This library provides:
//! - Plain HTTP and TLS listeners (SNI certificate selection) that can be
//!   started, stopped and moved between ports at runtime
//! - Rule-based forwarding of requests to backend services, with hop-by-hop
//!   header filtering and streamed bodies
//! - Supervision of the executables backing each service
//! - A password-protected admin endpoint exposing named procedures that
//!   read and change one persisted JSON configuration

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod tls;

pub use app::Goule;
pub use error::{Error, Result};
