//! HTTP surface for the quern inference service.

pub mod auth;
pub mod logging;
pub mod openapi;
pub mod routes;
pub mod state;
