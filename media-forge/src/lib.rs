//! media-forge: job orchestration for local media synthesis.
//!
//! Jobs are submitted through [`service::JobService`], persisted by
//! [`store::JobStore`] and executed by [`pipeline::Scheduler`], which runs
//! each job's stages in order and serialises GPU work through
//! [`device::DeviceArbiter`].

pub mod app;
pub mod artifact;
pub mod config;
pub mod database;
pub mod device;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod utils;

pub use error::{Error, Result};
