//! The rudder cluster controller.
//!
//! A controller is a leadership candidate for a single cluster. While leading, it drives every
//! partition replica of every resource towards its ideal state, one state model transition at a
//! time.

pub mod cache;
pub mod controller;
#[cfg(test)]
mod controller_test;
pub mod election;
#[cfg(test)]
mod fixtures;
pub mod monitor;
pub mod pipeline;
pub mod stages;

pub use controller::{Controller, ControllerConfig};
