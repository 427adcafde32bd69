//! HTTP API for the routing service.
//!
//! Handlers are thin: they authenticate the caller, decode the request and
//! delegate to [`RouteManager`](crate::manager::RouteManager).

pub mod auth;
pub mod dto;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod router;
pub mod state;

pub use router::create_router;
pub use state::AppState;
