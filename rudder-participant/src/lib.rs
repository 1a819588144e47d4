//! The rudder participant.
//!
//! A participant hosts partition replicas on behalf of a single instance. It announces the
//! instance as live, executes the state transitions addressed to its session and publishes the
//! resulting state of every replica.

pub mod engine;
#[cfg(test)]
mod fixtures;
pub mod handler;
pub mod participant;
#[cfg(test)]
mod participant_test;

pub use handler::{HandlerRegistry, LoggingHandler, TransitionHandler};
pub use participant::{Participant, ParticipantConfig};
