use thiserror::Error;

/// Rejections of user-supplied command input. These are surfaced to the user
/// verbatim and never mutate state; infrastructure failures stay in
/// `anyhow::Error` territory.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("daily limit must be a positive number of minutes")]
    InvalidLimit,
    #[error("'{0}' is not a usable domain")]
    InvalidDomain(String),
}
