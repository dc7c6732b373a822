//! Core types for the roomnight hotel analytics pipeline.
//!
//! This crate is deliberately free of database dependencies. It holds the
//! seed dataset model, the derivation engine (room-night expansion and
//! invoice construction), and the step graph that the storage backends
//! materialize.

pub mod billing;
pub mod dataset;
pub mod derive;
pub mod error;
pub mod graph;
pub mod money;
pub mod pipeline;
pub mod status;
pub mod store;

pub use error::{Error, Result};
