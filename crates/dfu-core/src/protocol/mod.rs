//! Protocol module - DFU class definitions.

pub mod constants;
pub mod status;

pub use constants::*;
pub use status::{DfuState, DfuStatus, describe_status};
