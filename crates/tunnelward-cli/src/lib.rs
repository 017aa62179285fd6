//! tunnelward CLI library
//!
//! Config resolution, rule input parsing and terminal output, shared by the
//! `tunnelward` binary and its tests.

pub mod display;
pub mod input;
pub mod settings;
