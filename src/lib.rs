//! Waypoint - edge API gateway decision engine
//!
//! Answers three questions per inbound request: where does it go, is the
//! caller allowed, and what related data belongs in the response. It exposes
//! all modules for testing purposes.

pub mod bootstrap;
pub mod cache;
pub mod errors;
pub mod events;
pub mod include;
pub mod jsonapi;
pub mod permissions;
pub mod pipeline;
pub mod policy;
pub mod principal;
pub mod routes;
pub mod settings;
pub mod web;
