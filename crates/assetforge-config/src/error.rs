//! Errors raised while loading `assetforge.kdl`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{0} is defined more than once")]
    Duplicate(String),

    #[error("unknown reference: {0}")]
    InvalidReference(String),

    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
