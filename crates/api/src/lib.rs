//! HTTP API for the engage invoicing backend: routing, authentication and
//! request/response mapping over the infra services.

pub mod app;
pub mod authz;
pub mod config;
pub mod context;
pub mod middleware;
