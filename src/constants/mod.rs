//! Default sizing of the simulated machine.

pub mod memory;
