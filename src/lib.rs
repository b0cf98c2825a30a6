//! Vehicle access gate library
//!
//! Shared by the `gate-node` and `gate-sim` binaries and the integration tests.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
