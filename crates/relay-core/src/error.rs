use std::path::PathBuf;

use thiserror::Error;

use crate::app::BuildError;
use crate::lock::LockError;
use crate::ports::BrokerError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Errors that stop an engine from starting.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("lock manager: {0}")]
    Lock(#[from] LockError),
}
