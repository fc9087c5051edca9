#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::struct_excessive_bools
)]

pub mod action;
pub mod array;
pub mod config;
pub mod controller;
pub mod evict_buffer;
pub mod fifo;
pub mod maf;
pub mod message;
pub mod pipeline;
pub mod process;
pub mod protocol;
pub mod request_tracker;
pub mod sim;
pub mod snoop_buffer;
pub mod state;
pub mod stats;

#[cfg(test)]
pub mod testing;

pub use controller::CacheController;
pub use message::{Message, MessageKind, Tracker, Transport};
pub use state::{BlockState, CacheLevel, CoherenceState};

pub type address = u64;

/// Simulation context threaded through every cycle-dependent call.
///
/// Holds the current cycle and a monotonically increasing serial counter,
/// so that no part of the engine depends on global state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimContext {
    pub cycle: u64,
    serial: u64,
}

impl SimContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the simulated clock by one cycle.
    pub fn tick(&mut self) {
        self.cycle += 1;
    }

    /// Returns a fresh serial number.
    pub fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }
}
