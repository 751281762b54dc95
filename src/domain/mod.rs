//! Domain Module
//!
//! Port traits and object helpers shared by the controller and its adapters.

pub mod objects;
pub mod ports;

pub use objects::*;
pub use ports::*;
