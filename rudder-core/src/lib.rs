//! Rudder core.
//!
//! Data models shared by the controller and participants, the cluster property path layout, and
//! the metadata store interface through which every component communicates.

pub mod admin;
#[cfg(test)]
mod admin_test;
pub mod error;
pub mod model;
pub mod paths;
pub mod store;
pub mod utils;

pub use error::{AppError, ShutdownError, ShutdownResult};
