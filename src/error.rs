//! Crate-level error type

use crate::chain::ChainError;
use crate::config::ConfigError;
use crate::network::protocol::ProtocolError;
use crate::network::server::ServerError;
use crate::network::transport::TransportError;
use crate::sync::{FetchError, SyncError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

pub type Result<T> = std::result::Result<T, Error>;
