//! Shared pieces of the tether binaries

pub mod common;
