//! DFU protocol engine.
//!
//! - `device`: request primitives and the download/upload workflows
//! - `properties`: capabilities from the functional descriptor
//! - `dfuse`: ST DfuSe detection and memory layouts

pub mod device;
pub mod dfuse;
pub mod properties;

pub use device::DfuDevice;
pub use dfuse::{DfuVariant, MemoryLayout, MemorySegment};
pub use properties::FunctionalProperties;
