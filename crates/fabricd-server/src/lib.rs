//! HTTP/JSON front end for the fabricd configuration control plane.
//!
//! One process holds an [`fabricd_engine::Engine`] over the three
//! backends and exposes it as a REST surface: resource CRUD under
//! collection and type routes, plus the action endpoints. Caller
//! identity arrives in forwarded auth headers; the gateway in front is
//! responsible for validating tokens.

pub mod api;
pub mod auth;
pub mod config;

pub use api::ApiServer;
pub use config::ServerConfig;
