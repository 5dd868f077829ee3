//! HTTP surface of the guard.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, timeout and trace layers, hot reload)
//!     → admission.rs (POST /v1/admission, GET /health)
//!     → admin (bearer-protected inspection and reset)
//! ```

pub mod admission;
pub mod server;

pub use server::{AppState, GuardServer};
