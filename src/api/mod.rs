//! API Layer
//!
//! REST API surface for the control plane: volume lifecycle, target
//! publishing, pool management, and node inspection.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
