use thiserror::Error;

/// Zone-text errors shared by the parser and everything that consumes it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid zone name: {0}")]
    InvalidZoneName(String),

    #[error("Invalid zone: {0}")]
    InvalidZone(String),
}
