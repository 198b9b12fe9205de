//! Core types shared by every component
//!
//! - `ConnectionState`: the authoritative connection state enum
//! - `TetherError`: the Timeout / Connection / Fatal error taxonomy

pub mod errors;
pub mod state;

pub use errors::{ErrorClass, TetherError, TetherResult};
pub use state::ConnectionState;
