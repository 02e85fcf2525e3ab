//! Image preprocessing worker
//!
//! Drains preprocessing jobs from a queue: each job names an input object, a
//! preprocessor profile and an output object. The worker fetches the input,
//! posts it to the remote preprocessor, stores the result and records the
//! job's status with timing metadata.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod worker;
