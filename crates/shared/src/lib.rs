#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NAGOYAMESHI Shared Types and Utilities
//!
//! Types, errors, and database helpers shared by the API server, the billing
//! crate, and the background worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
