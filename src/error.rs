use crate::config::ConfigError;
use crate::core::{IndexError, MergeError};
use crate::sync::{DecodeError, TransportError};

/// Errors surfaced by the public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
