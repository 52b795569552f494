//! Infrastructure layer: event storage, command dispatch, read models,
//! background jobs and the invoice generation pipeline.

pub mod command_dispatcher;
pub mod event_bus;
pub mod event_store;
pub mod invoicing;
pub mod jobs;
pub mod projections;
pub mod read_model;
pub mod workers;

mod integration_tests;
