//! d3: a filesystem-backed, S3-compatible object store.
//!
//! The storage engine lives in [`services`]; [`handlers`] and [`routes`]
//! expose it over HTTP.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
