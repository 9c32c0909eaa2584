//! The switch/host/link graph an experiment runs on.

pub mod topology;
pub mod types;

pub use topology::{Error as TopologyError, Interface, Topology};
pub use types::*;
