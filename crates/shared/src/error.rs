//! Error types shared across NAGOYAMESHI crates

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),
}
