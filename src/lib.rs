//! Multi-drop route orchestration for Speedy Van.
//!
//! Confirmed bookings become drops, the orchestration engine groups drops
//! into routes, and the route manager takes each route through approval,
//! dispatch and delivery.

pub mod booking;
pub mod config;
pub mod db;
pub mod earnings;
pub mod geo;
pub mod http;
pub mod manager;
pub mod model;
pub mod notify;
pub mod orchestration;
pub mod outbox;
pub mod scheduler;
