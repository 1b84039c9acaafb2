//! Thin wrappers around Linux kernel facilities.
//!
//! All `unsafe` code is concentrated here.

pub mod credentials;
pub mod signal;
pub mod tracefs;
